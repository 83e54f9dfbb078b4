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

//! Runtime configuration, loadable from a JSON file the way the
//! teacher's dev-dependency on `serde_json` implies it expects
//! configuration to arrive.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EmberError, EmberResult};

fn default_keepalive_secs() -> Option<u64> {
    Some(10)
}

fn default_request_timeout_millis() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: Option<u64>,
    #[serde(default = "default_request_timeout_millis")]
    pub request_timeout_millis: u64,
    #[serde(default)]
    pub use_non_escaping: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "0.0.0.0".to_owned(),
            port: 9000,
            keepalive_secs: default_keepalive_secs(),
            request_timeout_millis: default_request_timeout_millis(),
            use_non_escaping: false,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> EmberResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| EmberError::Deserialization(format!("invalid server config: {e}")))
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }

    pub fn socket_addr(&self) -> EmberResult<std::net::SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| EmberError::Connection(format!("invalid bind address: {e}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(Some(Duration::from_secs(10)), config.keepalive());
        assert_eq!(Duration::from_millis(2000), config.request_timeout());
    }

    #[test]
    fn parses_minimal_json() {
        let json = r#"{"bind_address": "127.0.0.1", "port": 9001}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(9001, config.port);
        assert_eq!(Some(Duration::from_secs(10)), config.keepalive());
    }

    #[test]
    fn null_keepalive_disables_it() {
        let json = r#"{"bind_address": "127.0.0.1", "port": 9001, "keepalive_secs": null}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(None, config.keepalive());
    }
}
