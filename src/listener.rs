/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Binds a socket, accepts clients, and hands each one off to
//! `connection::handle`. Generalizes the teacher's `accept_clients`/
//! `client_connected` pair in `provider.rs`, trading its per-client
//! `ClientHandler` callback for a plain connection task since the
//! dispatch behaviour here is fixed, not pluggable per application.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "tracing")]
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection;
use crate::error::EmberResult;
use crate::server::{ServerEvent, ServerState};
use crate::session::{SessionHandle, SessionId};

/// Binds `addr` and spawns the accept loop in the background. Returns
/// the socket's actual bound address, which may differ from `addr`
/// when the caller asked for an OS-assigned ephemeral port (`:0`).
pub async fn spawn(
    addr: SocketAddr,
    config: ServerConfig,
    state: Arc<RwLock<ServerState>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancellation: CancellationToken,
) -> EmberResult<SocketAddr> {
    let socket = TcpListener::bind(addr).await?;
    let bound_addr = socket.local_addr()?;
    tokio::spawn(accept_loop(socket, config, state, events, cancellation));
    Ok(bound_addr)
}

async fn accept_loop(
    socket: TcpListener,
    config: ServerConfig,
    state: Arc<RwLock<ServerState>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancellation: CancellationToken,
) {
    let clients: Arc<Mutex<HashMap<SessionId, SessionHandle>>> = Arc::new(Mutex::new(HashMap::new()));

    loop {
        select! {
            accepted = socket.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        #[cfg(feature = "tracing")]
                        info!(remote = %remote, "accepted connection");
                        let _ = events.send(ServerEvent::Connection(remote));
                        tokio::spawn(connection::handle(
                            stream,
                            state.clone(),
                            clients.clone(),
                            events.clone(),
                            config.clone(),
                            cancellation.clone(),
                        ));
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        error!(error = %e, "accept failed");
                        let _ = events.send(ServerEvent::Error(e.into()));
                    }
                }
            }
            _ = cancellation.cancelled() => {
                #[cfg(feature = "tracing")]
                info!("listener cancelled, no longer accepting connections");
                break;
            }
        }
    }
}
