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

//! Connection handling: accept loop, per-connection state machine, upstream dialing and
//! the relays that observe decrypted traffic.

pub mod client;
pub mod connection;
pub mod http2;
pub mod relay;
pub mod server;
pub mod stream;
pub mod upgrade;

pub use client::{Upstream, UpstreamConnector};
pub use connection::{ConnectionRegistry, ProxyConnection, ProxyContext};
pub use relay::{relay, relay_with_grace, Passthrough, RelayStats, TrafficObserver, HALF_CLOSE_GRACE};
pub use server::{ProxyServer, Shutdown};
pub use stream::{BoxedTransport, ByteStream, Transport};
