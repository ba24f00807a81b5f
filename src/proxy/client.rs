/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use http::Method;
use once_cell::sync::Lazy;
use rustls::{
    crypto::aws_lc_rs,
    pki_types::{pem::PemObject, CertificateDer, ServerName},
    ClientConfig, RootCertStore,
};
use tokio::{
    io::AsyncWriteExt,
    net::{lookup_host, TcpStream},
    task,
    time::{sleep, timeout},
};
use tokio_rustls::TlsConnector;

use super::stream::{BoxedTransport, ByteStream};
use crate::{
    config::UpstreamConfig,
    http::{HttpMessageReader, ReaderEvent, DEFAULT_MAX_HEAD_BYTES},
    utils::{ProxyError, ProxyResult},
};

const DNS_CACHE_TTL_SECS: u64 = 60;
const DNS_MAX_ATTEMPTS: usize = 3;
const DNS_RETRY_BACKOFF_MS: u64 = 50;
const CONNECT_RETRY_BACKOFF_MS: u64 = 100;
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PROXY_REPLY_BUFFER: usize = 16 * 1024;

static DNS_CACHE: Lazy<DnsCache> =
    Lazy::new(|| DnsCache::new(Duration::from_secs(DNS_CACHE_TTL_SECS)));

#[derive(Clone)]
struct CachedDnsEntry {
    expires_at: Instant,
    addrs: Vec<SocketAddr>,
}

/// Resolved addresses keyed by `host:port`. Expired entries are dropped on lookup and
/// swept whenever a fresh resolution is stored.
struct DnsCache {
    ttl: Duration,
    entries: DashMap<String, CachedDnsEntry>,
}

impl DnsCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn get(&self, key: &str, now: Instant) -> Option<Vec<SocketAddr>> {
        let cached = self.entries.get(key).map(|entry| entry.value().clone())?;
        if cached.expires_at > now && !cached.addrs.is_empty() {
            return Some(cached.addrs);
        }
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= now || entry.addrs.is_empty());
        None
    }

    fn insert(&self, key: String, addrs: Vec<SocketAddr>, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.insert(
            key,
            CachedDnsEntry {
                expires_at: now + self.ttl,
                addrs,
            },
        );
    }

    fn forget(&self, key: &str) {
        self.entries.remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An open transport towards an origin.
pub struct Upstream {
    pub stream: BoxedTransport,
    /// Plain HTTP going through an upstream proxy: requests need absolute-form targets.
    pub via_http_proxy: bool,
}

/// Dials origins directly or through the configured upstream proxy.
pub struct UpstreamConnector {
    roots: Arc<RootCertStore>,
}

impl UpstreamConnector {
    /// Trusts webpki-roots plus every certificate in `extra_roots` (PEM files).
    pub fn new(extra_roots: &[PathBuf]) -> ProxyResult<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        for path in extra_roots {
            let pem = fs::read(path).map_err(|err| {
                ProxyError::Configuration(format!("trust root {}: {err}", path.display()))
            })?;
            for cert in CertificateDer::pem_slice_iter(&pem) {
                let cert = cert.map_err(|err| {
                    ProxyError::Configuration(format!("trust root {}: {err}", path.display()))
                })?;
                roots.add(cert).map_err(|err| {
                    ProxyError::Configuration(format!("trust root {}: {err}", path.display()))
                })?;
            }
            tracing::debug!(path = %path.display(), "added upstream trust root");
        }

        Ok(Self {
            roots: Arc::new(roots),
        })
    }

    /// Opens a byte stream to `host:port`, tunnelling through the upstream proxy for
    /// HTTPS or forwarding to it for plain HTTP when one applies.
    pub async fn open(
        &self,
        host: &str,
        port: u16,
        https: bool,
        cfg: &UpstreamConfig,
    ) -> Result<Upstream> {
        let Some(proxy) = cfg.proxy_for(host, https) else {
            let tcp = connect_tcp(host, port, cfg).await?;
            return Ok(Upstream {
                stream: Box::new(tcp),
                via_http_proxy: false,
            });
        };

        let (proxy_host, proxy_port) = split_host_port(proxy, 8080)
            .with_context(|| format!("invalid upstream proxy address {proxy}"))?;
        let tcp = connect_tcp(&proxy_host, proxy_port, cfg).await?;

        if !https {
            tracing::debug!(%host, port, %proxy, "forwarding through upstream HTTP proxy");
            return Ok(Upstream {
                stream: Box::new(tcp),
                via_http_proxy: true,
            });
        }

        tracing::debug!(%host, port, %proxy, "tunnelling through upstream proxy");
        let tunnel = proxy_connect(tcp, host, port, cfg).await?;
        Ok(Upstream {
            stream: Box::new(tunnel),
            via_http_proxy: false,
        })
    }

    /// Runs the client side of TLS over `stream`, offering `alpn`.
    ///
    /// Returns the encrypted stream and the protocol the origin picked.
    pub async fn handshake(
        &self,
        stream: BoxedTransport,
        host: &str,
        alpn: Vec<Vec<u8>>,
    ) -> Result<(BoxedTransport, Option<Vec<u8>>)> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("crypto provider rejected default protocol versions")?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();
        config.alpn_protocols = alpn;

        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid hostname: {host}"))?;
        let connector = TlsConnector::from(Arc::new(config));

        let tls = match timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, stream)).await
        {
            Ok(result) => result.with_context(|| format!("TLS handshake failed with {host}"))?,
            Err(_) => bail!("TLS handshake with {host} timed out after {TLS_HANDSHAKE_TIMEOUT:?}"),
        };

        let negotiated = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        let alpn = negotiated.as_deref().map(String::from_utf8_lossy);
        tracing::debug!(%host, alpn = ?alpn, "upstream TLS handshake complete");
        Ok((Box::new(tls), negotiated))
    }
}

/// `Proxy-Authorization` value for the configured credentials.
pub fn proxy_authorization(cfg: &UpstreamConfig) -> Option<String> {
    let user = cfg.username.as_deref()?;
    let password = cfg.password.as_deref().unwrap_or_default();
    Some(format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))))
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().context("invalid port")?,
            None if tail.is_empty() => default_port,
            None => bail!("unexpected text after IPv6 literal"),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), port.parse().context("invalid port")?))
        }
        _ if authority.is_empty() => bail!("empty host"),
        _ => Ok((authority.to_string(), default_port)),
    }
}

async fn proxy_connect(
    tcp: TcpStream,
    host: &str,
    port: u16,
    cfg: &UpstreamConfig,
) -> Result<ByteStream> {
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = proxy_authorization(cfg) {
        head.push_str(&format!("Proxy-Authorization: {credentials}\r\n"));
    }
    head.push_str("\r\n");

    let mut stream = ByteStream::new(tcp, PROXY_REPLY_BUFFER);
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = HttpMessageReader::responses(0, DEFAULT_MAX_HEAD_BYTES);
    reader.expect_response_to(&Method::CONNECT);
    loop {
        let progress = reader.feed(stream.buffered())?;
        stream.consume(progress.consumed);
        match progress.event {
            Some(ReaderEvent::Complete(reply)) => {
                let status = reply
                    .status_line()
                    .map(|line| line.status)
                    .ok_or_else(|| anyhow!("upstream proxy sent a request line"))?;
                if !status.is_success() {
                    bail!("upstream proxy refused CONNECT {authority}: {status}");
                }
                return Ok(stream);
            }
            Some(_) => continue,
            None => {}
        }
        if stream.fill().await? == 0 {
            bail!("upstream proxy closed the connection during CONNECT {authority}");
        }
    }
}

async fn connect_tcp(host: &str, port: u16, cfg: &UpstreamConfig) -> Result<TcpStream> {
    let label = format!("{host}:{port}");
    let connect_timeout = cfg.connect_timeout();
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0..=cfg.connect_retries {
        if attempt > 0 {
            sleep(Duration::from_millis(CONNECT_RETRY_BACKOFF_MS * u64::from(attempt))).await;
        }

        let addrs = match resolve_upstream_addrs(host, port).await {
            Ok(addrs) => addrs,
            Err(err) => {
                last_err = Some(err.context(format!("failed to resolve {label}")));
                continue;
            }
        };

        for addr in addrs {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(%addr, attempt, "upstream TCP connected");
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    tracing::debug!(%addr, error = %err, "upstream TCP connect failed");
                    last_err = Some(err.into());
                }
                Err(_) => {
                    tracing::warn!(%addr, "upstream TCP connect timed out after {connect_timeout:?}");
                    last_err = Some(anyhow!("TCP connect to {addr} timed out"));
                }
            }
        }
        DNS_CACHE.forget(&label);
    }

    let err = last_err.unwrap_or_else(|| anyhow!("no addresses for {label}"));
    Err(err.context(format!("failed to connect to {label}")))
}

async fn resolve_upstream_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let key = format!("{host}:{port}");
    if let Some(addrs) = DNS_CACHE.get(&key, Instant::now()) {
        tracing::trace!(target: "dns", %host, port, "dns cache hit");
        return Ok(addrs);
    }

    let addrs = resolve_with_backoff(host, port).await?;
    DNS_CACHE.insert(key, addrs.clone(), Instant::now());
    Ok(addrs)
}

async fn resolve_with_backoff(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=DNS_MAX_ATTEMPTS {
        match lookup_host((host, port)).await {
            Ok(iter) => {
                let addrs: Vec<SocketAddr> = iter.collect();
                if !addrs.is_empty() {
                    return Ok(addrs);
                }
                last_err = Some(anyhow!("resolver returned no addresses for {host}:{port}"));
            }
            Err(err) => {
                tracing::warn!(target: "dns", %host, port, attempt, error = %err, "resolver error");
                last_err = Some(err.into());
            }
        }

        if attempt < DNS_MAX_ATTEMPTS {
            sleep(Duration::from_millis(DNS_RETRY_BACKOFF_MS * attempt as u64)).await;
        }
    }

    tracing::warn!(target: "dns", %host, port, "resolver exhausted retries; trying the system resolver");
    match resolve_with_system(host, port).await {
        Ok(addrs) if !addrs.is_empty() => Ok(addrs),
        Ok(_) => Err(last_err.unwrap_or_else(|| anyhow!("no addresses for {host}:{port}"))),
        Err(fallback_err) => Err(last_err.unwrap_or(fallback_err)),
    }
}

async fn resolve_with_system(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let host_owned = host.to_string();
    task::spawn_blocking(move || {
        (&host_owned[..], port)
            .to_socket_addrs()
            .map(|iter| iter.collect::<Vec<_>>())
            .map_err(|err| anyhow!(err))
    })
    .await
    .context("system resolver task failed")?
}
