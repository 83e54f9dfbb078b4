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

//! A minimal device tree served over Ember+/S101, for manual testing
//! against any Glow-speaking control client.

use embercore::glow::{MatrixAddressingMode, MatrixType, ParameterAccess, Value};
use embercore::tree::Tree;
use embercore::{EmberServer, ServerConfig, ServerEvent};
use std::future::pending;
use tracing::info;

fn fixture_tree() -> Tree {
    let mut tree = Tree::new();
    let root = tree.root();

    let source = tree.add_node(root, 1, "source", Some("signal source".to_owned()));
    tree.add_parameter(
        source,
        1,
        "gain",
        ParameterAccess::ReadWrite,
        Some(Value::Integer(0)),
    );
    tree.add_parameter(
        source,
        2,
        "label",
        ParameterAccess::Read,
        Some(Value::String("demo source".to_owned())),
    );

    tree.add_matrix(
        root,
        2,
        "router",
        MatrixType::OneToN,
        MatrixAddressingMode::Linear,
        4,
        4,
    );

    tree
}

#[tokio::main]
async fn main() -> embercore::EmberResult<()> {
    tracing_subscriber::fmt().init();

    let config = ServerConfig {
        bind_address: "0.0.0.0".to_owned(),
        port: 9000,
        ..Default::default()
    };

    let mut server = EmberServer::new(fixture_tree());
    let (addr, mut events) = server.listen(config).await?;
    info!(%addr, "ember+ server bound");

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Listening(addr) => info!(%addr, "listening"),
                ServerEvent::Connection(remote) => info!(%remote, "client connected"),
                ServerEvent::Disconnect(remote) => info!(%remote, "client disconnected"),
                ServerEvent::ClientError { remote, error } => {
                    info!(%remote, %error, "client error")
                }
                ServerEvent::ValueChanged { path } => info!(?path, "value changed"),
                ServerEvent::MatrixChanged { path } => info!(?path, "matrix changed"),
                ServerEvent::Error(e) => info!(%e, "server error"),
            }
        }
    });

    pending::<()>().await;
    Ok(())
}
