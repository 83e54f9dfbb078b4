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

//! The public facade: holds the shared tree and subscription
//! registry, and owns the listener task. Generalizes the teacher's
//! `start_tcp_provider` entry point, trading its `ClientHandler`
//! trait for a plain event channel since this crate's clients are
//! Ember+ peers, not an arbitrary callback contract.

use std::net::SocketAddr;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::EmberResult;
use crate::listener;
use crate::subscription::Registry;
use crate::tree::Tree;

/// The tree plus the subscription table, guarded by a single lock so
/// a dispatch is always read-modify-notify atomic with respect to
/// concurrent requests from other clients.
pub struct ServerState {
    pub tree: Tree,
    pub registry: Registry,
}

impl ServerState {
    pub fn new(tree: Tree) -> Self {
        ServerState {
            tree,
            registry: Registry::new(),
        }
    }
}

/// Everything a caller may want to observe about the running server,
/// mirroring the listener-level events of spec.md §6.
#[derive(Debug)]
pub enum ServerEvent {
    Listening(SocketAddr),
    Connection(SocketAddr),
    Disconnect(SocketAddr),
    ClientError { remote: SocketAddr, error: String },
    ValueChanged { path: Vec<i32> },
    MatrixChanged { path: Vec<i32> },
    Error(crate::error::EmberError),
}

/// A running Ember+ server: the accept loop plus the shared state it
/// serves requests against. `shutdown()` cancels the accept loop and
/// every in-flight connection task started from it; it does not wait
/// for them to finish, matching the teacher's fire-and-forget
/// `spawn` per accepted client.
pub struct EmberServer {
    state: std::sync::Arc<RwLock<ServerState>>,
    cancellation: CancellationToken,
}

impl EmberServer {
    /// Builds a server around an already-populated tree. The tree is
    /// the application's device model; this crate only ever mutates
    /// it in response to client requests.
    pub fn new(tree: Tree) -> Self {
        EmberServer {
            state: std::sync::Arc::new(RwLock::new(ServerState::new(tree))),
            cancellation: CancellationToken::new(),
        }
    }

    /// Binds `config`'s address and starts accepting clients in the
    /// background. Returns the socket's actual bound address (useful
    /// when `config.port == 0` asks for an OS-assigned ephemeral
    /// port) plus the event stream; callers observe connects,
    /// disconnects, and tree changes through it.
    pub async fn listen(
        &mut self,
        config: ServerConfig,
    ) -> EmberResult<(SocketAddr, mpsc::UnboundedReceiver<ServerEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let addr = config.socket_addr()?;
        let bound_addr = listener::spawn(
            addr,
            config,
            self.state.clone(),
            events_tx.clone(),
            self.cancellation.clone(),
        )
        .await?;
        let _ = events_tx.send(ServerEvent::Listening(bound_addr));
        Ok((bound_addr, events_rx))
    }

    /// Stops accepting new connections and tears down every
    /// connection task the listener started.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    pub fn state(&self) -> std::sync::Arc<RwLock<ServerState>> {
        self.state.clone()
    }
}
