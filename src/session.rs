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

//! One client connection's identity and its outbound handle. Per-client
//! ordering (spec.md §4.2's request pump) falls out of `connection::handle`
//! awaiting each decoded message's dispatch to completion before reading
//! the next frame, so no separate re-entrant queue is needed here — see
//! design note §9. Keepalive responses and fan-out notifications go
//! straight to the outbound sender and are never stuck behind a request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::codec::{ember_message_frames, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn new() -> Self {
        SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub fn new_for_test(id: u64) -> Self {
        SessionId(id)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle used by the dispatcher/listener to reach a live connection
/// without holding its socket directly.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub remote: SocketAddr,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl SessionHandle {
    /// Sends a frame to this session's writer task.
    pub fn send_now(&self, frame: OutboundFrame) {
        let _ = self.outbound.send(frame);
    }

    pub fn send_ember_message(&self, message: &[u8]) {
        for frame in ember_message_frames(message) {
            self.send_now(frame);
        }
    }
}

/// Builds the handle for one accepted connection. `outbound` is the
/// sender half already wired to the connection's writer task.
pub fn spawn_session(
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
) -> SessionHandle {
    SessionHandle {
        id: SessionId::new(),
        remote,
        outbound,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn send_ember_message_frames_land_in_order_on_the_outbound_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let handle = spawn_session(remote, tx);

        handle.send_ember_message(&[1, 2, 3]);
        handle.send_now(OutboundFrame::KeepaliveRequest);

        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Ember(_))));
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::KeepaliveRequest)));
        assert!(rx.try_recv().is_err());
    }
}
