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

use miette::Diagnostic;
use rasn::error::{DecodeError, EncodeError};
use std::io;
use thiserror::Error;

/// Transport / protocol / semantic error classification. Transport
/// errors disconnect a single client; protocol errors are swallowed at
/// the codec boundary or surfaced as a `ServerEvent::Error` without
/// closing the connection; semantic errors surface alongside a minimal
/// tree-root response when a client context exists. No variant here is
/// allowed to propagate across a client's boundary and kill the
/// server.
#[derive(Debug, Error, Diagnostic)]
pub enum EmberError {
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("S101 decoder error: {0}")]
    S101Decode(String),
    #[error("BER encode error: {0}")]
    BerEncode(#[from] EncodeError),
    #[error("BER decode error: {0}")]
    BerDecode(#[from] DecodeError),
    #[error("semantic error: {0}")]
    Semantic(String),
}

pub type EmberResult<T> = Result<T, EmberError>;
