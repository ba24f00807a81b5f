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

use std::time::Duration;

use anyhow::Result;
use tokio::{
    io::AsyncWriteExt,
    sync::broadcast,
    time::{sleep_until, Instant},
};

use super::stream::ByteStream;
use crate::utils::ProxyResult;

/// How long the surviving direction may keep talking after the other side half-closed.
pub const HALF_CLOSE_GRACE: Duration = Duration::from_secs(60);

/// Sees every chunk the relay forwards, after it has been forwarded.
///
/// An error stops the relay and tears the connection down.
pub trait TrafficObserver: Send {
    fn on_client_bytes(&mut self, bytes: &[u8]) -> ProxyResult<()>;
    fn on_server_bytes(&mut self, bytes: &[u8]) -> ProxyResult<()>;
}

/// Observer for tunnels nobody looks into.
#[derive(Debug, Default)]
pub struct Passthrough;

impl TrafficObserver for Passthrough {
    fn on_client_bytes(&mut self, _bytes: &[u8]) -> ProxyResult<()> {
        Ok(())
    }

    fn on_server_bytes(&mut self, _bytes: &[u8]) -> ProxyResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_server: u64,
    pub server_to_client: u64,
}

/// [`relay_with_grace`] with the default [`HALF_CLOSE_GRACE`].
pub async fn relay<O: TrafficObserver>(
    client: &mut ByteStream,
    server: &mut ByteStream,
    observer: &mut O,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<RelayStats> {
    relay_with_grace(client, server, observer, shutdown, HALF_CLOSE_GRACE).await
}

/// Copies bytes both ways until both directions finish, `half_close_grace` runs out
/// after one side half-closed, or shutdown is signalled.
///
/// Bytes already sitting in either stream's buffer are forwarded first.
pub async fn relay_with_grace<O: TrafficObserver>(
    client: &mut ByteStream,
    server: &mut ByteStream,
    observer: &mut O,
    shutdown: &mut broadcast::Receiver<()>,
    half_close_grace: Duration,
) -> Result<RelayStats> {
    let mut stats = RelayStats::default();
    let mut client_open = true;
    let mut server_open = true;
    let mut deadline: Option<Instant> = None;

    forward_client(client, server, observer, &mut stats).await?;
    forward_server(server, client, observer, &mut stats).await?;

    while client_open || server_open {
        let grace = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            read = client.fill(), if client_open => {
                if read? == 0 {
                    client_open = false;
                    let _ = server.shutdown().await;
                    deadline.get_or_insert_with(|| Instant::now() + half_close_grace);
                } else {
                    forward_client(client, server, observer, &mut stats).await?;
                }
            }
            read = server.fill(), if server_open => {
                if read? == 0 {
                    server_open = false;
                    let _ = client.shutdown().await;
                    deadline.get_or_insert_with(|| Instant::now() + half_close_grace);
                } else {
                    forward_server(server, client, observer, &mut stats).await?;
                }
            }
            _ = grace => {
                tracing::debug!("half-closed relay exceeded grace period");
                break;
            }
            _ = shutdown.recv() => {
                tracing::debug!("relay interrupted by shutdown");
                break;
            }
        }
    }

    tracing::debug!(
        client_to_server = stats.client_to_server,
        server_to_client = stats.server_to_client,
        "relay completed"
    );
    Ok(stats)
}

async fn forward_client<O: TrafficObserver>(
    client: &mut ByteStream,
    server: &mut ByteStream,
    observer: &mut O,
    stats: &mut RelayStats,
) -> Result<()> {
    let chunk = client.take_buffered();
    if chunk.is_empty() {
        return Ok(());
    }
    server.write_all(&chunk).await?;
    server.flush().await?;
    stats.client_to_server += chunk.len() as u64;
    observer.on_client_bytes(&chunk)?;
    Ok(())
}

async fn forward_server<O: TrafficObserver>(
    server: &mut ByteStream,
    client: &mut ByteStream,
    observer: &mut O,
    stats: &mut RelayStats,
) -> Result<()> {
    let chunk = server.take_buffered();
    if chunk.is_empty() {
        return Ok(());
    }
    client.write_all(&chunk).await?;
    client.flush().await?;
    stats.server_to_client += chunk.len() as u64;
    observer.on_server_bytes(&chunk)?;
    Ok(())
}
