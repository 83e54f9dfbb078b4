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

//! Per-socket task set: reader, writer, and keepalive timer. The
//! reader loop awaits each decoded message's dispatch to completion
//! before reading the next frame, which is itself the per-client
//! request pump spec.md §4.2 describes — see `session.rs`.
//! Generalizes the teacher's `com.rs` staged pipeline onto
//! `tokio_util::codec`'s `FramedRead`/`FramedWrite`.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::codec::{CodecEvent, OutboundFrame, S101Codec};
use crate::config::ServerConfig;
use crate::dispatcher;
use crate::error::EmberError;
use crate::glow;
use crate::server::{ServerEvent, ServerState};
use crate::session::{spawn_session, SessionHandle, SessionId};
use crate::utils::path_string;

pub async fn handle(
    socket: TcpStream,
    state: Arc<RwLock<ServerState>>,
    clients: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    config: ServerConfig,
    cancellation: CancellationToken,
) {
    let remote = match socket.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = events.send(ServerEvent::Error(e.into()));
            return;
        }
    };

    let (read_half, write_half) = socket.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let session = spawn_session(remote, outbound_tx.clone());
    let session_id = session.id;
    clients.lock().await.insert(session_id, session.clone());

    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, S101Codec::new());
        while let Some(frame) = outbound_rx.recv().await {
            if framed.send(frame).await.is_err() {
                break;
            }
        }
    });

    let keepalive_handle = config.keepalive().map(|period| {
        let session = session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                session.send_now(OutboundFrame::KeepaliveRequest);
            }
        })
    });

    let mut framed_reader = FramedRead::new(read_half, S101Codec::new());
    loop {
        let next = select! {
            next = framed_reader.next() => next,
            // Listener shutdown: stop reading so the socket (and this
            // task's half of it) is dropped below, matching spec.md
            // §5 "Shutdown of the listener closes all active sockets."
            _ = cancellation.cancelled() => None,
        };
        match next {
            Some(Ok(CodecEvent::KeepaliveRequest)) => {
                session.send_now(OutboundFrame::KeepaliveResponse);
            }
            Some(Ok(CodecEvent::KeepaliveResponse)) => {
                // liveness acknowledged; nothing further to do.
            }
            Some(Ok(CodecEvent::EmberMessage(message))) => {
                handle_ember_message(&state, &clients, &session, &events, message).await;
            }
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                warn!(remote = %remote, error = %e, "s101 decode error");
                let _ = events.send(ServerEvent::ClientError {
                    remote,
                    error: e.to_string(),
                });
                // protocol errors do not close the connection; the
                // stream may resynchronize on the next BOF.
            }
            None => break,
        }
    }

    if let Some(handle) = keepalive_handle {
        handle.abort();
    }
    writer.abort();
    drop(framed_reader);
    clients.lock().await.remove(&session_id);
    state.write().await.registry.drop_session(session_id);
    let _ = events.send(ServerEvent::Disconnect(remote));
    #[cfg(feature = "tracing")]
    debug!(remote = %remote, "client disconnected");
}

async fn handle_ember_message(
    state: &Arc<RwLock<ServerState>>,
    clients: &Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    session: &SessionHandle,
    events: &mpsc::UnboundedSender<ServerEvent>,
    message: Vec<u8>,
) {
    let root = match glow::decode_root(&message) {
        Ok(root) => root,
        Err(e) => {
            let _ = events.send(ServerEvent::ClientError {
                remote: session.remote,
                error: e.to_string(),
            });
            return;
        }
    };

    let mut guard = state.write().await;
    let outcome =
        match dispatcher::handle_root(&mut guard.tree, &mut guard.registry, session.id, root) {
            Ok(outcome) => outcome,
            Err(EmberError::Semantic(msg)) => {
                let _ = events.send(ServerEvent::ClientError {
                    remote: session.remote,
                    error: msg,
                });
                return;
            }
            Err(e) => {
                let _ = events.send(ServerEvent::Error(e));
                return;
            }
        };
    drop(guard);

    if let Some(response) = &outcome.response {
        session.send_ember_message(response);
    }

    if !outcome.notifications.is_empty() {
        let live_clients = clients.lock().await;
        let read_guard = state.read().await;
        for notification in &outcome.notifications {
            fan_out(&read_guard, &live_clients, session.id, notification, events);
        }
    }
}

fn fan_out(
    state: &ServerState,
    clients: &HashMap<SessionId, SessionHandle>,
    origin: SessionId,
    notification: &dispatcher::Notification,
    events: &mpsc::UnboundedSender<ServerEvent>,
) {
    let path = notification.path().to_vec();
    let event = match notification {
        dispatcher::Notification::ValueChanged { .. } => ServerEvent::ValueChanged { path },
        dispatcher::Notification::MatrixChanged { .. } => ServerEvent::MatrixChanged { path },
    };
    let _ = events.send(event);

    let path_key = path_string(
        &notification
            .path()
            .iter()
            .map(|&n| n as u32)
            .collect::<Vec<_>>(),
    );
    let Some(subscribers) = state.registry.subscribers(&path_key) else {
        return;
    };

    for &subscriber in subscribers {
        if subscriber == origin {
            continue;
        }
        if let Some(handle) = clients.get(&subscriber) {
            handle.send_ember_message(notification.response());
        }
    }
}
