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
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{http::DEFAULT_MAX_HEAD_BYTES, tls::cert::CacheTier};

/// Top-level configuration parsed from the proxy's TOML file.
///
/// Every section and field has a default, so an empty file (or no file at all, through
/// `ProxyConfig::default()`) yields a working loopback proxy that decrypts HTTPS with a
/// freshly generated root.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listener: ListenerConfig,
    pub tls: TlsConfig,
    pub capture: CaptureConfig,
    pub upstream: UpstreamConfig,
    pub telemetry: TelemetryConfig,
}

impl ProxyConfig {
    /// Reads the config file, deserializes TOML, and resolves relative paths against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg = Self::from_toml(&raw)
            .with_context(|| format!("invalid proxy config: {}", path.display()))?;

        if let Some(base_dir) = path.parent() {
            cfg.absolutize(base_dir);
        }
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: ProxyConfig = toml::from_str(raw)?;
        Ok(cfg)
    }

    fn absolutize(&mut self, base_dir: &Path) {
        let tls = &mut self.tls;
        absolutize_path(base_dir, &mut tls.store_dir);
        if let Some(path) = tls.export_ca_path.as_mut() {
            absolutize_path(base_dir, path);
        }
        if let Some(root) = tls.custom_root.as_mut() {
            absolutize_path(base_dir, &mut root.cert_path);
            absolutize_path(base_dir, &mut root.key_path);
        }
        for custom in &mut tls.custom_certificates {
            absolutize_path(base_dir, &mut custom.cert_path);
            absolutize_path(base_dir, &mut custom.key_path);
        }
        for root in &mut tls.upstream_trust_roots {
            absolutize_path(base_dir, root);
        }
    }
}

fn absolutize_path(base_dir: &Path, target: &mut PathBuf) {
    if target.is_relative() {
        *target = base_dir.join(&*target);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_address: String,
    /// Port 0 asks the OS for an ephemeral port.
    pub bind_port: u16,
    /// Ceiling for a request/response head and for a trailer block.
    pub max_header_bytes: usize,
    /// Bytes a connection may buffer ahead of the parser.
    pub read_buffer_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            bind_port: 8080,
            max_header_bytes: DEFAULT_MAX_HEAD_BYTES,
            read_buffer_bytes: 256 * 1024,
        }
    }
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.bind_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid listener address {}:{}",
                    self.bind_address, self.bind_port
                )
            })
    }
}

/// A certificate and its PKCS#8 private key, both PEM.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyPairPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// An operator-supplied certificate served for `host` instead of a generated one.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomCertificateConfig {
    pub host: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Terminate TLS inside CONNECT tunnels. When false every tunnel is relayed raw.
    pub decrypt_https: bool,
    /// Hosts (exact or `*.suffix`) whose tunnels are relayed raw.
    pub excluded_hosts: Vec<String>,
    /// Directory backing the persistent certificate store.
    pub store_dir: PathBuf,
    /// Common name of a generated root certificate.
    pub issuer_name: String,
    /// Name the root certificate is stored under.
    pub root_name: String,
    pub create_root_if_missing: bool,
    pub lookup_order: Vec<CacheTier>,
    pub install_tiers: Vec<CacheTier>,
    /// Root certificate for the custom tier, preferred over the store.
    pub custom_root: Option<KeyPairPaths>,
    pub custom_certificates: Vec<CustomCertificateConfig>,
    /// Where to write the root certificate PEM for clients to trust.
    pub export_ca_path: Option<PathBuf>,
    /// Extra PEM roots trusted for upstream connections, on top of webpki-roots.
    pub upstream_trust_roots: Vec<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            decrypt_https: true,
            excluded_hosts: Vec::new(),
            store_dir: PathBuf::from("certs"),
            issuer_name: "Intercept Proxy CA".into(),
            root_name: "intercept-root".into(),
            create_root_if_missing: true,
            lookup_order: vec![CacheTier::Custom, CacheTier::Memory, CacheTier::Store],
            install_tiers: vec![CacheTier::Memory, CacheTier::Store],
            custom_root: None,
            custom_certificates: Vec::new(),
            export_ca_path: None,
            upstream_trust_roots: Vec::new(),
        }
    }
}

impl TlsConfig {
    /// Whether CONNECT traffic to `host` should be decrypted.
    pub fn intercepts(&self, host: &str) -> bool {
        self.decrypt_https
            && !self
                .excluded_hosts
                .iter()
                .any(|pattern| host_matches(pattern, host))
    }
}

/// `*.example.com` matches subdomains only; anything else is an exact, case-insensitive match.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            let (host, suffix) = (host.as_bytes(), suffix.as_bytes());
            host.len() > suffix.len() + 1
                && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
                && host[host.len() - suffix.len() - 1] == b'.'
        }
        None => pattern.eq_ignore_ascii_case(host),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Retain body and payload bytes for subscribers.
    pub enabled: bool,
    /// Bodies or messages larger than this are counted but not retained.
    pub max_body_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl CaptureConfig {
    /// Effective capture limit; 0 when capture is disabled.
    pub fn limit(&self) -> usize {
        if self.enabled {
            self.max_body_bytes
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// `host:port` of an HTTP proxy used for plain HTTP requests.
    pub http_proxy: Option<String>,
    /// `host:port` of an HTTP proxy tunnelled through (CONNECT) for HTTPS.
    pub https_proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Hosts that bypass the upstream proxy (same patterns as `excluded_hosts`).
    pub bypass: Vec<String>,
    pub connect_timeout_secs: u64,
    pub connect_retries: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            http_proxy: None,
            https_proxy: None,
            username: None,
            password: None,
            bypass: Vec::new(),
            connect_timeout_secs: 10,
            connect_retries: 2,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// The upstream proxy to use for `host`, if any.
    pub fn proxy_for(&self, host: &str, https: bool) -> Option<&str> {
        if self.bypass.iter().any(|pattern| host_matches(pattern, host)) {
            return None;
        }
        if https {
            self.https_proxy.as_deref()
        } else {
            self.http_proxy.as_deref()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Telemetry output: human-friendly stdout or structured JSON.
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Print structured, readable logs to stdout.
    #[default]
    Stdout,
    /// Emit JSON objects for ingestion systems.
    Json,
}
