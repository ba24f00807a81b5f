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
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use http::{Method, Uri};
use rustls::server::Acceptor;
use tokio::{io::AsyncWriteExt, sync::broadcast, time::timeout};
use tokio_rustls::LazyConfigAcceptor;
use uuid::Uuid;

use super::{
    client::{proxy_authorization, split_host_port, UpstreamConnector},
    http2::Http2Observer,
    relay::{relay_with_grace, Passthrough, HALF_CLOSE_GRACE},
    stream::{BoxedTransport, ByteStream, Transport},
    upgrade::WebSocketObserver,
};
use crate::{
    config::{TlsConfig, UpstreamConfig},
    events::{ConnectionInfo, EventHub, HttpSession, ProxyEvent, SessionProtocol},
    http::{
        message::version_label, Headers, HttpMessage, HttpMessageReader, ReaderEvent,
        RequestLine, StartLine,
    },
    tls::CertificateCache,
    websocket,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// State shared by every connection of one proxy instance.
pub struct ProxyContext {
    pub certs: Arc<CertificateCache>,
    pub connector: Arc<UpstreamConnector>,
    pub events: Arc<EventHub>,
    pub registry: Arc<ConnectionRegistry>,
    pub tls: TlsConfig,
    pub capture_limit: usize,
    pub max_head_bytes: usize,
    pub read_buffer_bytes: usize,
    /// How long a relay keeps the surviving direction open after a half-close.
    pub half_close_grace: Duration,
    upstream: ArcSwap<UpstreamConfig>,
}

impl ProxyContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        certs: Arc<CertificateCache>,
        connector: Arc<UpstreamConnector>,
        events: Arc<EventHub>,
        tls: TlsConfig,
        upstream: UpstreamConfig,
        capture_limit: usize,
        max_head_bytes: usize,
        read_buffer_bytes: usize,
    ) -> Self {
        Self {
            certs,
            connector,
            events,
            registry: Arc::new(ConnectionRegistry::default()),
            tls,
            capture_limit,
            max_head_bytes,
            read_buffer_bytes,
            half_close_grace: HALF_CLOSE_GRACE,
            upstream: ArcSwap::from_pointee(upstream),
        }
    }

    pub fn with_half_close_grace(mut self, grace: Duration) -> Self {
        self.half_close_grace = grace;
        self
    }

    /// Replaces the upstream settings. Connections already accepted keep the old ones.
    pub fn set_upstream(&self, upstream: UpstreamConfig) {
        self.upstream.store(Arc::new(upstream));
    }

    pub fn upstream_snapshot(&self) -> Arc<UpstreamConfig> {
        self.upstream.load_full()
    }
}

/// Live connections, keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    live: DashMap<Uuid, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<ConnectionInfo> {
        self.live.get(id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.live.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Publishes the closing events when the connection goes away, however it ends.
struct ConnectionGuard {
    id: Uuid,
    events: Arc<EventHub>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    fn open(ctx: &ProxyContext, peer: SocketAddr) -> Self {
        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            client_addr: peer,
            accepted_at: SystemTime::now(),
        };
        ctx.registry.live.insert(info.id, info.clone());
        let guard = Self {
            id: info.id,
            events: ctx.events.clone(),
            registry: ctx.registry.clone(),
        };
        ctx.events.publish(ProxyEvent::ConnectionAdded(info));
        guard
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.events.publish(ProxyEvent::Disposing {
            connection_id: self.id,
        });
        self.registry.live.remove(&self.id);
        self.events.publish(ProxyEvent::ConnectionRemoved {
            connection_id: self.id,
        });
    }
}

#[derive(Debug, PartialEq)]
enum Protocol {
    Tls,
    Http,
    Unknown,
}

fn detect_protocol(first: u8) -> Protocol {
    match first {
        0x16 => Protocol::Tls,
        b'A'..=b'Z' => Protocol::Http,
        _ => Protocol::Unknown,
    }
}

/// Where requests on a connection are headed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    https: bool,
}

impl Target {
    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

struct Http1Upstream {
    target: Target,
    stream: ByteStream,
    via_http_proxy: bool,
}

enum Http1Outcome {
    Closed,
    Connect(Target),
}

/// One accepted client connection.
///
/// **Lifecycle:**
/// 1. Peek the first byte: `0x16` is a TLS ClientHello (transparent client), a capital
///    letter is an HTTP request line.
/// 2. Plain HTTP requests are forwarded one exchange at a time; a CONNECT switches to
///    tunnel mode.
/// 3. Tunnels are decrypted (certificate from [`CertificateCache`]) unless the host is
///    excluded, then decoded as HTTP/1.1, WebSocket or HTTP/2 while being relayed.
/// 4. Dropping the connection publishes `Disposing` then `ConnectionRemoved`.
pub struct ProxyConnection {
    id: Uuid,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    upstream_cfg: Arc<UpstreamConfig>,
    shutdown: broadcast::Receiver<()>,
    _guard: ConnectionGuard,
}

impl ProxyConnection {
    /// Registers the connection and publishes `ConnectionAdded`.
    pub fn new(ctx: Arc<ProxyContext>, peer: SocketAddr, shutdown: broadcast::Receiver<()>) -> Self {
        // Taken before `ConnectionAdded` is published.
        let upstream_cfg = ctx.upstream_snapshot();
        let guard = ConnectionGuard::open(&ctx, peer);
        Self {
            id: guard.id,
            peer,
            upstream_cfg,
            ctx,
            shutdown,
            _guard: guard,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serves the connection until either side closes or shutdown is signalled.
    pub async fn run(mut self, transport: impl Transport + 'static) -> Result<()> {
        let mut shutdown = self.shutdown.resubscribe();
        tokio::select! {
            result = self.serve(Box::new(transport)) => result,
            _ = shutdown.recv() => {
                tracing::debug!(peer = %self.peer, "connection closed by shutdown");
                Ok(())
            }
        }
    }

    async fn serve(&mut self, transport: BoxedTransport) -> Result<()> {
        let mut client = ByteStream::from_boxed(transport, self.ctx.read_buffer_bytes);
        let first = match client.fill().await {
            Ok(0) => {
                tracing::debug!(peer = %self.peer, "client closed before sending anything");
                return Ok(());
            }
            Ok(_) => client.peek(0).unwrap_or_default(),
            Err(err) if is_disconnect(&err) => {
                tracing::debug!(peer = %self.peer, error = %err, "client dropped before sending anything");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match detect_protocol(first) {
            Protocol::Tls => {
                tracing::debug!(peer = %self.peer, "direct TLS connection detected");
                self.intercept(client, None).await
            }
            Protocol::Http => match self.serve_http1(&mut client, None).await? {
                Http1Outcome::Closed => Ok(()),
                Http1Outcome::Connect(target) => self.serve_connect(client, target).await,
            },
            Protocol::Unknown => {
                tracing::warn!(peer = %self.peer, first_byte = first, "rejecting connection with unknown protocol");
                bail!("unknown protocol (first byte {first:#04x})")
            }
        }
    }

    async fn serve_connect(&mut self, mut client: ByteStream, target: Target) -> Result<()> {
        if self.ctx.tls.intercepts(&target.host) {
            client.write_all(CONNECT_ESTABLISHED).await?;
            client.flush().await?;
            tracing::info!(peer = %self.peer, target = %target.authority(), "CONNECT tunnel established, intercepting");
            return self.intercept(client, Some(target)).await;
        }

        let upstream = match self
            .ctx
            .connector
            .open(&target.host, target.port, true, &self.upstream_cfg)
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                let _ = client.write_all(BAD_GATEWAY).await;
                return Err(err.context(format!("tunnel to {}", target.authority())));
            }
        };
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;
        tracing::info!(peer = %self.peer, target = %target.authority(), "CONNECT tunnel established, relaying raw");

        let mut upstream = ByteStream::from_boxed(upstream.stream, self.ctx.read_buffer_bytes);
        relay_with_grace(
            &mut client,
            &mut upstream,
            &mut Passthrough,
            &mut self.shutdown,
            self.ctx.half_close_grace,
        )
        .await?;
        Ok(())
    }

    /// Terminates the client's TLS with a generated certificate and decodes what flows
    /// inside. `connect` is the CONNECT target; transparent clients are routed by SNI.
    async fn intercept(&mut self, client: ByteStream, connect: Option<Target>) -> Result<()> {
        let start = timeout(
            HANDSHAKE_TIMEOUT,
            LazyConfigAcceptor::new(Acceptor::default(), client),
        )
        .await
        .map_err(|_| anyhow!("ClientHello not received within {HANDSHAKE_TIMEOUT:?}"))?
        .context("failed to read ClientHello")?;

        let hello = start.client_hello();
        let sni = hello.server_name().map(str::to_string);
        let offered: Vec<Vec<u8>> = hello
            .alpn()
            .map(|protocols| {
                protocols
                    .filter(|proto| *proto == ALPN_H2 || *proto == ALPN_HTTP11)
                    .map(<[u8]>::to_vec)
                    .collect()
            })
            .unwrap_or_default();

        let target = match connect {
            Some(target) => target,
            None => Target {
                host: sni
                    .clone()
                    .ok_or_else(|| anyhow!("direct TLS client sent no SNI"))?,
                port: 443,
                https: true,
            },
        };
        let server_name = sni.unwrap_or_else(|| target.host.clone());
        tracing::debug!(peer = %self.peer, sni = %server_name, alpn = offered.len(), "client hello received");

        let upstream = self
            .ctx
            .connector
            .open(&target.host, target.port, true, &self.upstream_cfg)
            .await
            .with_context(|| format!("upstream connect to {}", target.authority()))?;
        let (upstream, negotiated) = self
            .ctx
            .connector
            .handshake(upstream.stream, &server_name, offered)
            .await?;

        let cert = self.ctx.certs.resolve(&server_name).await?;
        let config = cert.server_config(negotiated.iter().cloned().collect())?;
        let client_tls = timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
            .await
            .map_err(|_| anyhow!("client TLS handshake timed out after {HANDSHAKE_TIMEOUT:?}"))?
            .with_context(|| format!("client TLS handshake failed for {}", self.peer))?;
        tracing::info!(peer = %self.peer, sni = %server_name, "client handshake complete");

        let mut client = ByteStream::new(client_tls, self.ctx.read_buffer_bytes);
        let mut upstream = ByteStream::from_boxed(upstream, self.ctx.read_buffer_bytes);

        if negotiated.as_deref() == Some(ALPN_H2) {
            tracing::debug!(peer = %self.peer, "observing HTTP/2 tunnel");
            let mut observer = Http2Observer::new(
                self.ctx.events.clone(),
                self.id,
                self.peer,
                target.authority(),
                self.ctx.capture_limit,
            );
            relay_with_grace(
                &mut client,
                &mut upstream,
                &mut observer,
                &mut self.shutdown,
                self.ctx.half_close_grace,
            )
            .await?;
            return Ok(());
        }

        let origin = Http1Upstream {
            target: target.clone(),
            stream: upstream,
            via_http_proxy: false,
        };
        match self.serve_http1(&mut client, Some(origin)).await? {
            Http1Outcome::Closed => Ok(()),
            Http1Outcome::Connect(_) => bail!("nested CONNECT inside an intercepted tunnel"),
        }
    }

    /// HTTP/1.x exchange loop.
    ///
    /// With `tunnel` set every request goes to that origin; otherwise each request's own
    /// target picks (and if needed reopens) the upstream. Request heads are rewritten
    /// for the upstream; bodies and responses are relayed byte for byte.
    async fn serve_http1(
        &mut self,
        client: &mut ByteStream,
        tunnel: Option<Http1Upstream>,
    ) -> Result<Http1Outcome> {
        let fixed = tunnel.as_ref().map(|origin| origin.target.clone());
        let mut slot = tunnel;
        let mut requests =
            HttpMessageReader::requests(self.ctx.capture_limit, self.ctx.max_head_bytes);
        let mut responses =
            HttpMessageReader::responses(self.ctx.capture_limit, self.ctx.max_head_bytes);

        loop {
            match next_event(&mut requests, client, None).await? {
                None => return Ok(Http1Outcome::Closed),
                Some(ReaderEvent::HeadComplete) => {}
                Some(_) => bail!("request framing out of sync"),
            }
            let (line, headers) = match requests.head() {
                Some((StartLine::Request(line), headers)) => (line.clone(), headers.clone()),
                _ => bail!("request head unavailable after HeadComplete"),
            };

            if line.method == Method::CONNECT {
                if fixed.is_some() {
                    bail!("CONNECT inside an intercepted tunnel");
                }
                let (host, port) = split_host_port(&line.target, 443)
                    .with_context(|| format!("invalid CONNECT target {}", line.target))?;
                // CONNECT requests carry no body; drain the reader back to idle.
                next_event(&mut requests, client, None).await?;
                return Ok(Http1Outcome::Connect(Target {
                    host,
                    port,
                    https: true,
                }));
            }

            let (target, path) = match &fixed {
                Some(target) => (target.clone(), line.target.clone()),
                None => request_target(&line, &headers)?,
            };
            let has_body = headers.is_chunked() || headers.content_length()?.unwrap_or(0) > 0;

            let origin = match self.ensure_upstream(&mut slot, &target).await {
                Ok(origin) => origin,
                Err(err) => {
                    let _ = client.write_all(BAD_GATEWAY).await;
                    return Err(err);
                }
            };
            let forward_target = if origin.via_http_proxy {
                format!("http://{}{}", target.authority(), path)
            } else {
                path
            };
            let credentials = origin
                .via_http_proxy
                .then(|| proxy_authorization(&self.upstream_cfg))
                .flatten();
            let head = serialize_request_head(&line, &forward_target, &headers, credentials.as_deref());
            origin.stream.write_all(&head).await?;
            origin.stream.flush().await?;
            responses.expect_response_to(&line.method);

            let mut session = HttpSession {
                id: Uuid::new_v4(),
                connection_id: self.id,
                client_addr: self.peer,
                target: target.authority(),
                is_https: target.https,
                protocol: SessionProtocol::Http1,
                stream_id: None,
                request: head_only(&line, &headers),
                response: None,
            };

            let origin_spoke_first = has_body
                && headers.has_token("expect", "100-continue")
                && await_continue(client, &mut origin.stream).await?;
            if origin_spoke_first {
                match next_event(&mut responses, &mut origin.stream, Some(&mut *client)).await? {
                    Some(ReaderEvent::Interim(status)) => {
                        tracing::debug!(peer = %self.peer, %status, "origin answered Expect: 100-continue");
                    }
                    Some(ReaderEvent::HeadComplete) => {
                        // Final answer before the body: the client decides whether to
                        // send it, so the connection cannot be reused.
                        let response = finish_response(&mut responses, &mut origin.stream, client).await?;
                        session.response = Some(response);
                        self.ctx
                            .events
                            .publish(ProxyEvent::ResponseSent(Arc::new(session)));
                        return Ok(Http1Outcome::Closed);
                    }
                    Some(ReaderEvent::Complete(response)) => {
                        session.response = Some(response);
                        self.ctx
                            .events
                            .publish(ProxyEvent::ResponseSent(Arc::new(session)));
                        return Ok(Http1Outcome::Closed);
                    }
                    None => bail!("origin closed before answering Expect: 100-continue"),
                }
            }

            let request = match next_event(&mut requests, client, Some(&mut origin.stream)).await? {
                Some(ReaderEvent::Complete(request)) => request,
                _ => bail!("client closed before the request body was complete"),
            };
            session.request = request;
            self.ctx
                .events
                .publish(ProxyEvent::RequestSent(Arc::new(session.clone())));

            let response_until_close = {
                let response = finish_response(&mut responses, &mut origin.stream, client).await?;
                let until_close = origin.stream.is_eof();
                tracing::debug!(
                    peer = %self.peer,
                    method = %line.method,
                    target = %session.target,
                    status = ?response.status_line().map(|status| status.status),
                    "exchange complete"
                );
                session.response = Some(response);
                until_close
            };

            let Some(response) = session.response.as_ref() else {
                bail!("response missing after completion");
            };
            let upgraded = response
                .status_line()
                .map(|status| status.status == http::StatusCode::SWITCHING_PROTOCOLS)
                .unwrap_or(false);
            let websocket = websocket::is_upgrade(&session.request.headers, response);
            let keep_alive = session.request.keep_alive() && response.keep_alive();
            let session_id = session.id;
            self.ctx
                .events
                .publish(ProxyEvent::ResponseSent(Arc::new(session)));

            if upgraded {
                let Some(mut origin) = slot.take() else {
                    bail!("upstream vanished during upgrade");
                };
                if websocket {
                    tracing::debug!(peer = %self.peer, "switching to WebSocket relay");
                    let mut observer = WebSocketObserver::new(
                        self.ctx.events.clone(),
                        self.id,
                        session_id,
                        self.ctx.capture_limit,
                    );
                    relay_with_grace(
                        client,
                        &mut origin.stream,
                        &mut observer,
                        &mut self.shutdown,
                        self.ctx.half_close_grace,
                    )
                    .await?;
                } else {
                    tracing::debug!(peer = %self.peer, "switching to raw relay after upgrade");
                    relay_with_grace(
                        client,
                        &mut origin.stream,
                        &mut Passthrough,
                        &mut self.shutdown,
                        self.ctx.half_close_grace,
                    )
                    .await?;
                }
                return Ok(Http1Outcome::Closed);
            }

            if response_until_close || !keep_alive {
                return Ok(Http1Outcome::Closed);
            }
        }
    }

    async fn ensure_upstream<'a>(
        &self,
        slot: &'a mut Option<Http1Upstream>,
        target: &Target,
    ) -> Result<&'a mut Http1Upstream> {
        let reusable = slot
            .as_ref()
            .map(|origin| origin.target == *target && !origin.stream.is_eof())
            .unwrap_or(false);
        if !reusable {
            tracing::debug!(peer = %self.peer, target = %target.authority(), "opening upstream");
            let upstream = self
                .ctx
                .connector
                .open(&target.host, target.port, target.https, &self.upstream_cfg)
                .await
                .with_context(|| format!("upstream connect to {}", target.authority()))?;
            let (stream, via_http_proxy) = if target.https {
                let (tls, _) = self
                    .ctx
                    .connector
                    .handshake(upstream.stream, &target.host, vec![ALPN_HTTP11.to_vec()])
                    .await?;
                (tls, false)
            } else {
                (upstream.stream, upstream.via_http_proxy)
            };
            *slot = Some(Http1Upstream {
                target: target.clone(),
                stream: ByteStream::from_boxed(stream, self.ctx.read_buffer_bytes),
                via_http_proxy,
            });
        }
        slot.as_mut().ok_or_else(|| anyhow!("upstream unavailable"))
    }
}

/// Feeds `source` into `reader` until it yields an event.
///
/// Consumed bytes are copied to `sink` when one is given. `None` means the peer closed
/// cleanly between messages.
async fn next_event(
    reader: &mut HttpMessageReader,
    source: &mut ByteStream,
    mut sink: Option<&mut ByteStream>,
) -> Result<Option<ReaderEvent>> {
    loop {
        let progress = reader.feed(source.buffered())?;
        if progress.consumed > 0 {
            if let Some(sink) = sink.as_deref_mut() {
                sink.write_all(&source.buffered()[..progress.consumed]).await?;
                sink.flush().await?;
            }
            source.consume(progress.consumed);
        }
        if let Some(event) = progress.event {
            return Ok(Some(event));
        }

        let read = match source.fill().await {
            Ok(read) => read,
            // TLS peers that skip close_notify.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            return Ok(reader.close()?.map(ReaderEvent::Complete));
        }
    }
}

/// Waits on both peers after an `Expect: 100-continue` head.
///
/// Returns true when the origin answered before the client sent any body byte. Either
/// peer may move first: clients can send the body without waiting and origins can skip
/// the interim reply.
async fn await_continue(client: &mut ByteStream, origin: &mut ByteStream) -> Result<bool> {
    loop {
        if !client.buffered().is_empty() {
            return Ok(false);
        }
        if !origin.buffered().is_empty() {
            return Ok(true);
        }
        tokio::select! {
            read = origin.fill() => {
                if read? == 0 {
                    bail!("origin closed before answering Expect: 100-continue");
                }
            }
            read = client.fill() => {
                if read? == 0 {
                    bail!("client closed before sending the request body");
                }
            }
        }
    }
}

/// Relays the rest of a response (interim replies included) to the client.
async fn finish_response(
    responses: &mut HttpMessageReader,
    origin: &mut ByteStream,
    client: &mut ByteStream,
) -> Result<HttpMessage> {
    loop {
        match next_event(responses, origin, Some(&mut *client)).await? {
            Some(ReaderEvent::Complete(response)) => return Ok(response),
            Some(ReaderEvent::HeadComplete) | Some(ReaderEvent::Interim(_)) => continue,
            None => bail!("origin closed the connection without responding"),
        }
    }
}

/// Resolves a proxy request's origin and the origin-form path to send it.
fn request_target(line: &RequestLine, headers: &Headers) -> Result<(Target, String)> {
    if line.target.starts_with('/') || line.target == "*" {
        let host = headers
            .get("host")
            .ok_or_else(|| anyhow!("origin-form request without Host header"))?;
        let (host, port) = split_host_port(host, 80)?;
        return Ok((
            Target {
                host,
                port,
                https: false,
            },
            line.target.clone(),
        ));
    }

    let uri: Uri = line
        .target
        .parse()
        .with_context(|| format!("invalid request target {}", line.target))?;
    let https = match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => false,
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => true,
        _ => bail!("unsupported request target {}", line.target),
    };
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("request target without host: {}", line.target))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
        .to_string();
    Ok((Target { host, port, https }, path))
}

/// Proxy-only header fields never reach the origin.
fn serialize_request_head(
    line: &RequestLine,
    target: &str,
    headers: &Headers,
    proxy_credentials: Option<&str>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(line.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version_label(line.version).as_bytes());
    out.extend_from_slice(b"\r\n");
    for field in headers {
        if field.is("proxy-connection") || field.is("proxy-authorization") {
            continue;
        }
        out.extend_from_slice(field.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(&field.value);
        out.extend_from_slice(b"\r\n");
    }
    if let Some(credentials) = proxy_credentials {
        out.extend_from_slice(b"Proxy-Authorization: ");
        out.extend_from_slice(credentials.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn head_only(line: &RequestLine, headers: &Headers) -> HttpMessage {
    HttpMessage {
        start_line: StartLine::Request(line.clone()),
        headers: headers.clone(),
        body: Default::default(),
        body_len: 0,
        body_truncated: false,
        trailers: Headers::new(),
    }
}

pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
