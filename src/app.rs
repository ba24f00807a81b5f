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

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use tokio::{sync::broadcast, task};

use crate::{
    config::ProxyConfig,
    events::EventHub,
    proxy::{ProxyContext, ProxyServer, Shutdown, UpstreamConnector},
    telemetry::TelemetrySink,
    tls::{CertificateCache, FileCertificateStore, RcgenCertificateProvider},
    utils::ProxyResult,
};

/// Wires configuration, certificate infrastructure, the event hub and the proxy server.
///
/// Initialization order:
/// 1. Event hub with the telemetry subscriber, so later steps' events are rendered.
/// 2. Certificate cache: loads or creates the root. A missing root with creation disabled
///    fails here, before the listener exists.
/// 3. Root export for clients, upstream connector with its trust roots.
/// 4. ProxyServer, ready to bind.
pub struct ProxyApp {
    server: ProxyServer,
    events: Arc<EventHub>,
}

impl ProxyApp {
    pub async fn new(config: ProxyConfig) -> Result<Self> {
        let events = Arc::new(EventHub::new());
        events.subscribe(Arc::new(TelemetrySink::new(&config.telemetry)));

        // Root creation is CPU-bound and the store does blocking file I/O.
        let tls_cfg = config.tls.clone();
        let certs = task::spawn_blocking(move || -> ProxyResult<CertificateCache> {
            let store = Arc::new(FileCertificateStore::open(&tls_cfg.store_dir)?);
            CertificateCache::from_config(Arc::new(RcgenCertificateProvider), store, &tls_cfg)
        })
        .await
        .context("certificate setup task failed")??;
        let certs = Arc::new(certs);

        if let Some(path) = &config.tls.export_ca_path {
            export_root(path, &certs.root_pem())?;
            tracing::info!(path = %path.display(), "exported root certificate");
        }

        let connector = Arc::new(UpstreamConnector::new(&config.tls.upstream_trust_roots)?);
        let ctx = Arc::new(ProxyContext::new(
            certs,
            connector,
            events.clone(),
            config.tls.clone(),
            config.upstream.clone(),
            config.capture.limit(),
            config.listener.max_header_bytes,
            config.listener.read_buffer_bytes,
        ));
        let server = ProxyServer::new(config.listener.clone(), ctx);

        Ok(Self { server, events })
    }

    /// Hub to register additional subscribers on before calling [`ProxyApp::run`].
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.server.shutdown_handle()
    }

    /// Runs the accept loop until Ctrl+C or [`Shutdown::trigger`].
    pub async fn run(self) -> Result<()> {
        let mut fatal = self.events.fatal_errors();
        tokio::spawn(async move {
            loop {
                match fatal.recv().await {
                    Ok(err) => tracing::error!(
                        subscriber = %err.subscriber,
                        event = err.event,
                        connection = ?err.connection_id,
                        "{}",
                        err.message
                    ),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "fatal error log lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let shutdown = self.server.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
                shutdown.trigger();
            }
        });
        self.server.run().await
    }
}

fn export_root(path: &Path, pem: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, pem).with_context(|| format!("failed to write {}", path.display()))
}
