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

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::broadcast};

use super::connection::{is_disconnect, ProxyConnection, ProxyContext};
use crate::{config::ListenerConfig, events::FatalError};

/// Broadcast signal telling the accept loop and every live connection to stop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Tasks still listening for the signal.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the listening socket and spawns one task per accepted connection.
///
/// **Error Handling:**
/// - Bind errors propagate to the caller.
/// - Per-connection errors are logged inside the connection's task and never stop the loop.
/// - Transient accept errors (peer reset during the handshake) are skipped; anything else
///   is reported on the fatal channel and ends the loop.
pub struct ProxyServer {
    listener_cfg: ListenerConfig,
    ctx: Arc<ProxyContext>,
    shutdown: Shutdown,
}

impl ProxyServer {
    pub fn new(listener_cfg: ListenerConfig, ctx: Arc<ProxyContext>) -> Self {
        Self {
            listener_cfg,
            ctx,
            shutdown: Shutdown::new(),
        }
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.listener_cfg.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(listener)
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "proxy listener online");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(addr = %local, live = self.ctx.registry.len(), "listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.spawn_connection(socket, peer),
                    Err(err) if is_transient_accept_error(&err) => {
                        tracing::debug!(error = %err, "transient accept error");
                    }
                    Err(err) => {
                        self.ctx.events.report_fatal(FatalError {
                            subscriber: "accept-loop".into(),
                            event: "accept",
                            connection_id: None,
                            message: err.to_string(),
                        });
                        return Err(err).context("accept loop failed");
                    }
                },
            }
        }
    }

    fn spawn_connection(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.subscribe();
        tracing::debug!(%peer, "accepted client");

        tokio::spawn(async move {
            let connection = ProxyConnection::new(ctx, peer, shutdown);
            let id = connection.id();
            if let Err(err) = connection.run(socket).await {
                if is_disconnect_chain(&err) {
                    tracing::debug!(%peer, connection = %id, "client session ended: {err:#}");
                } else {
                    tracing::warn!(%peer, connection = %id, "client session ended with error: {err:#}");
                }
            }
        });
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn is_disconnect_chain(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(is_disconnect)
}
