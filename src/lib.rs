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

//! An Ember+ (S101/Glow) tree control protocol server: frame codec,
//! BER tree model, per-client sessions, and request dispatch, wired
//! together behind a TCP listener.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod glow;
pub mod listener;
pub mod packet;
pub mod s101;
pub mod server;
pub mod session;
pub mod subscription;
pub mod tree;
pub mod utils;

pub use config::ServerConfig;
pub use error::{EmberError, EmberResult};
pub use server::{EmberServer, ServerEvent, ServerState};
pub use tree::{ElementId, Tree};
