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

//! Turns a decoded [`Root`] into tree mutations, a direct response,
//! and a set of change notifications — the one place that knows what
//! a GetDirectory/Subscribe/Unsubscribe/set-value/matrix-connection
//! request means against the live tree.

use crate::error::{EmberError, EmberResult};
use crate::glow::{
    Command, CommandOptions, CommandType, Connection, Element, ElementCollection, FieldFlags,
    Root, RootElement, RootElementCollection, Value,
};
use crate::session::SessionId;
use crate::subscription::Registry;
use crate::tree::{ElementId, MutationEffect, Tree};
use crate::utils::path_string;
use std::collections::BTreeSet;

/// What changed, and the already-encoded response bytes to fan out to
/// every other subscriber of the affected path.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ValueChanged {
        path: Vec<i32>,
        response: Vec<u8>,
    },
    MatrixChanged {
        path: Vec<i32>,
        targets: Vec<i32>,
        response: Vec<u8>,
    },
}

impl Notification {
    pub fn path(&self) -> &[i32] {
        match self {
            Notification::ValueChanged { path, .. } => path,
            Notification::MatrixChanged { path, .. } => path,
        }
    }

    pub fn response(&self) -> &[u8] {
        match self {
            Notification::ValueChanged { response, .. } => response,
            Notification::MatrixChanged { response, .. } => response,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// BER bytes to send back to the requesting session, if any.
    pub response: Option<Vec<u8>>,
    /// Other sessions (subscribers) that should be told about a
    /// change, along with what changed and the bytes to send them.
    pub notifications: Vec<Notification>,
}

/// Resolves a single top-level `RootElement` against the tree and
/// applies whatever command, value, or connection set it carries.
///
/// spec.md requires exactly one top-level element per request; a
/// message with more than one is a semantic error, reported back
/// rather than silently processing only the first.
pub fn handle_root(
    tree: &mut Tree,
    registry: &mut Registry,
    session: SessionId,
    root: Root,
) -> EmberResult<DispatchOutcome> {
    let elements = match root {
        Root::Elements(RootElementCollection(elements)) => elements,
        Root::Streams(_) => {
            return Err(EmberError::Semantic(
                "stream collections are not accepted as client requests".to_owned(),
            ));
        }
        Root::InvocationResult(_) => {
            return Err(EmberError::Semantic(
                "invocation results are not accepted as client requests".to_owned(),
            ));
        }
    };

    if elements.len() != 1 {
        return Err(EmberError::Semantic(format!(
            "expected exactly one top-level element, got {}",
            elements.len()
        )));
    }

    match elements.into_iter().next().unwrap() {
        RootElement::Element(element) => handle_unqualified(tree, registry, session, element),
        RootElement::QualifiedParameter(q) => {
            let id = tree
                .get_element_by_path(&oid_numbers(&q.path))
                .ok_or_else(|| EmberError::Semantic(format!("no such path: {}", q.path)))?;
            if let Some(command) = single_child_command(q.children)? {
                return handle_command(tree, registry, session, id, command, true);
            }
            match q.contents.and_then(|c| c.value) {
                Some(value) => apply_value(tree, id, value, true),
                None => Ok(DispatchOutcome::default()),
            }
        }
        RootElement::QualifiedNode(q) => {
            let id = tree
                .get_element_by_path(&oid_numbers(&q.path))
                .ok_or_else(|| EmberError::Semantic(format!("no such path: {}", q.path)))?;
            match single_child_command(q.children)? {
                Some(command) => handle_command(tree, registry, session, id, command, true),
                None => Ok(DispatchOutcome::default()),
            }
        }
        RootElement::QualifiedMatrix(q) => {
            let id = tree
                .get_element_by_path(&oid_numbers(&q.path))
                .ok_or_else(|| EmberError::Semantic(format!("no such matrix: {}", q.path)))?;
            if let Some(command) = single_child_command(q.children)? {
                return handle_command(tree, registry, session, id, command, true);
            }
            apply_matrix_connections(tree, id, q.connections.map(|c| c.0), true)
        }
        RootElement::QualifiedFunction(_) | RootElement::QualifiedTemplate(_) => {
            Err(EmberError::Semantic(
                "functions and templates are read-only in this server".to_owned(),
            ))
        }
    }
}

fn oid_numbers(path: &rasn::types::ObjectIdentifier) -> Vec<i32> {
    path.iter().map(|&n| n as i32).collect()
}

/// A request node's `children` is meaningful only when it carries
/// exactly one `Command` — anything else (a mix of commands and
/// values, more than one command) is a malformed request.
fn single_child_command(children: Option<ElementCollection>) -> EmberResult<Option<Command>> {
    let Some(ElementCollection(mut children)) = children else {
        return Ok(None);
    };
    if children.len() != 1 {
        return Err(EmberError::Semantic(
            "expected at most one child command in request".to_owned(),
        ));
    }
    match children.remove(0) {
        Element::Command(command) => Ok(Some(command)),
        _ => Ok(None),
    }
}

/// Walks an unqualified (pure number-path) request down its chain of
/// single-child containers to the deepest element or command, per
/// spec.md §4.4.
fn handle_unqualified(
    tree: &mut Tree,
    registry: &mut Registry,
    session: SessionId,
    element: Element,
) -> EmberResult<DispatchOutcome> {
    descend_unqualified(tree, registry, session, tree.root(), element)
}

fn descend_unqualified(
    tree: &mut Tree,
    registry: &mut Registry,
    session: SessionId,
    parent: ElementId,
    element: Element,
) -> EmberResult<DispatchOutcome> {
    match element {
        Element::Command(command) => handle_command(tree, registry, session, parent, command, false),
        Element::Node(node) => {
            let id = resolve_child(tree, parent, node.number)?;
            match node.children {
                None => Ok(DispatchOutcome::default()),
                Some(ElementCollection(mut children)) => {
                    if children.len() != 1 {
                        return Err(EmberError::Semantic(
                            "expected a single nested child in unqualified request".to_owned(),
                        ));
                    }
                    descend_unqualified(tree, registry, session, id, children.remove(0))
                }
            }
        }
        Element::Parameter(parameter) => {
            let id = resolve_child(tree, parent, parameter.number)?;
            match parameter.contents.and_then(|c| c.value) {
                Some(value) => apply_value(tree, id, value, false),
                None => Ok(DispatchOutcome::default()),
            }
        }
        Element::Matrix(matrix) => {
            let id = resolve_child(tree, parent, matrix.number)?;
            apply_matrix_connections(tree, id, matrix.connections.map(|c| c.0), false)
        }
        Element::Function(_) | Element::Template(_) => Err(EmberError::Semantic(
            "functions and templates are read-only in this server".to_owned(),
        )),
    }
}

fn resolve_child(tree: &Tree, parent: ElementId, number: i32) -> EmberResult<ElementId> {
    tree.child_by_number(parent, number)
        .ok_or_else(|| EmberError::Semantic(format!("no such element: {number}")))
}

fn handle_command(
    tree: &mut Tree,
    registry: &mut Registry,
    session: SessionId,
    target: ElementId,
    command: Command,
    qualified: bool,
) -> EmberResult<DispatchOutcome> {
    match command.number {
        CommandType::GetDirectory => {
            let flags = match command.options {
                Some(CommandOptions::DirFieldMask(f)) => f,
                _ => FieldFlags::Default,
            };
            auto_subscribe(tree, registry, session, target);
            Ok(DispatchOutcome {
                response: Some(encode_directory(tree, target, qualified, flags)?),
                notifications: Vec::new(),
            })
        }
        CommandType::Subscribe => {
            registry.subscribe(path_key(tree, target), session);
            Ok(DispatchOutcome::default())
        }
        CommandType::Unsubscribe => {
            registry.unsubscribe(&path_key(tree, target), session);
            Ok(DispatchOutcome::default())
        }
        CommandType::Invoke => Err(EmberError::Semantic(
            "invoke is not supported by this server".to_owned(),
        )),
    }
}

/// spec.md §4.4: a matrix or a non-streamed parameter subscribes on
/// its own path; anything else (a node) subscribes each immediate
/// child instead.
fn auto_subscribe(tree: &Tree, registry: &mut Registry, session: SessionId, target: ElementId) {
    let subscribe_target_itself =
        tree.is_matrix(target) || (tree.is_parameter(target) && !tree.is_stream_parameter(target));
    if subscribe_target_itself {
        registry.subscribe(path_key(tree, target), session);
    } else {
        for &child in tree.children(target) {
            registry.subscribe(path_key(tree, child), session);
        }
    }
}

fn path_key(tree: &Tree, id: ElementId) -> String {
    path_string(&tree.path_of(id).iter().map(|&n| n as u32).collect::<Vec<_>>())
}

fn apply_value(
    tree: &mut Tree,
    id: ElementId,
    value: Value,
    qualified: bool,
) -> EmberResult<DispatchOutcome> {
    let effect = tree.set_parameter_value(id, value);
    match effect {
        MutationEffect::ValueChanged { .. } => {
            let path = tree.path_of(id);
            let root_element = tree
                .parameter_response(id, qualified)
                .ok_or_else(|| EmberError::Semantic("parameter vanished during write".to_owned()))?;
            let response = crate::glow::encode_root(&Root::from(root_element))?;
            Ok(DispatchOutcome {
                response: Some(response.clone()),
                notifications: vec![Notification::ValueChanged { path, response }],
            })
        }
        _ => Ok(DispatchOutcome::default()),
    }
}

fn apply_matrix_connections(
    tree: &mut Tree,
    id: ElementId,
    connections: Option<Vec<Connection>>,
    qualified: bool,
) -> EmberResult<DispatchOutcome> {
    if !tree.is_matrix(id) {
        return Err(EmberError::Semantic("target is not a matrix".to_owned()));
    }
    let Some(connections) = connections else {
        return Ok(DispatchOutcome::default());
    };
    if connections.is_empty() {
        return Ok(DispatchOutcome::default());
    }

    let target_count = tree
        .matrix_target_count(id)
        .ok_or_else(|| EmberError::Semantic("matrix missing targetCount".to_owned()))?;

    let mut touched = Vec::new();
    for connection in connections {
        if connection.target < 0 || connection.target >= target_count {
            return Err(EmberError::Semantic(format!(
                "matrix target {} out of range 0..{target_count}",
                connection.target
            )));
        }
        let sources: BTreeSet<i32> = connection
            .sources
            .map(|p| p.to_sources().into_iter().map(|n| n as i32).collect())
            .unwrap_or_default();
        let operation = connection
            .operation
            .unwrap_or(crate::glow::ConnectionOperation::Absolute);
        let effect = tree.apply_connection(id, connection.target, &sources, operation);
        if !matches!(effect, MutationEffect::NoOp) {
            touched.push(connection.target);
        }
    }

    if touched.is_empty() {
        return Ok(DispatchOutcome::default());
    }

    let path = tree.path_of(id);
    let root_element = tree
        .matrix_response(id, &touched, qualified)
        .ok_or_else(|| EmberError::Semantic("matrix vanished during connect".to_owned()))?;
    let response = crate::glow::encode_root(&Root::from(root_element))?;
    Ok(DispatchOutcome {
        response: Some(response.clone()),
        notifications: vec![Notification::MatrixChanged {
            path,
            targets: touched,
            response,
        }],
    })
}

/// Builds the GetDirectory response: `target`'s children, each with
/// its own contents duplicated but its grandchildren trimmed (spec.md
/// §8 scenario 2), shaped to match the request.
fn encode_directory(
    tree: &Tree,
    target: ElementId,
    qualified: bool,
    _flags: FieldFlags,
) -> EmberResult<Vec<u8>> {
    let root = if target == tree.root() {
        let elements = tree
            .children(target)
            .iter()
            .filter_map(|c| tree.to_element(*c, false))
            .map(RootElement::Element)
            .collect();
        Root::Elements(RootElementCollection(elements))
    } else if qualified {
        let root_element = tree.to_qualified(target, true).ok_or_else(|| {
            EmberError::Semantic("element vanished during directory lookup".to_owned())
        })?;
        Root::from(root_element)
    } else {
        let leaf = tree.to_element(target, true).ok_or_else(|| {
            EmberError::Semantic("element vanished during directory lookup".to_owned())
        })?;
        Root::from(tree.tree_branch(target, leaf))
    };
    crate::glow::encode_root(&root)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::glow::{ParameterAccess, Value};

    fn fixture() -> (Tree, Registry, SessionId) {
        let mut tree = Tree::new();
        let root = tree.root();
        tree.add_parameter(
            root,
            1,
            "gain",
            ParameterAccess::ReadWrite,
            Some(Value::Integer(0)),
        );
        (tree, Registry::new(), SessionId::new_for_test(1))
    }

    #[test]
    fn get_directory_at_root_lists_children() {
        let (mut tree, mut registry, session) = fixture();
        let outcome = handle_root(
            &mut tree,
            &mut registry,
            session,
            Root::from(Command::get_directory(None)),
        )
        .unwrap();
        assert!(outcome.response.is_some());
        assert!(outcome.notifications.is_empty());
    }

    #[test]
    fn get_directory_auto_subscribes_each_child_path() {
        let (mut tree, mut registry, session) = fixture();
        handle_root(
            &mut tree,
            &mut registry,
            session,
            Root::from(Command::get_directory(None)),
        )
        .unwrap();
        assert!(registry.subscribers("1").is_some());
    }

    #[test]
    fn multiple_top_level_elements_is_a_semantic_error() {
        let (mut tree, mut registry, session) = fixture();
        let root = Root::Elements(RootElementCollection(vec![
            RootElement::Element(Element::Command(Command::get_directory(None))),
            RootElement::Element(Element::Command(Command::get_directory(None))),
        ]));
        assert!(handle_root(&mut tree, &mut registry, session, root).is_err());
    }

    #[test]
    fn set_value_on_writable_parameter_notifies() {
        let (mut tree, _registry, _session) = fixture();
        let gain_id = tree.get_element_by_path(&[1]).unwrap();
        let outcome = apply_value(&mut tree, gain_id, Value::Integer(7), true).unwrap();
        assert_eq!(1, outcome.notifications.len());
        assert_eq!(vec![1], outcome.notifications[0].path());
        assert!(outcome.response.is_some());
    }

    #[test]
    fn read_only_parameter_write_is_silent_no_op() {
        let mut tree = Tree::new();
        let root = tree.root();
        let ro = tree.add_parameter(
            root,
            1,
            "status",
            ParameterAccess::Read,
            Some(Value::Integer(1)),
        );
        let outcome = apply_value(&mut tree, ro, Value::Integer(2), true).unwrap();
        assert!(outcome.response.is_none());
        assert!(outcome.notifications.is_empty());
    }

    #[test]
    fn matrix_connect_reports_only_touched_target() {
        use crate::glow::{ConnectionOperation, MatrixAddressingMode, MatrixType, PackedNumbers};
        use std::collections::BTreeSet;

        let mut tree = Tree::new();
        let root = tree.root();
        let matrix = tree.add_matrix(
            root,
            1,
            "router",
            MatrixType::OneToN,
            MatrixAddressingMode::Linear,
            4,
            4,
        );
        let mut existing = BTreeSet::new();
        existing.insert(0);
        tree.apply_connection(matrix, 1, &existing, ConnectionOperation::Absolute);

        let mut sources = BTreeSet::new();
        sources.insert(2);
        let connection = Connection {
            target: 1,
            sources: Some(PackedNumbers::from_sources(
                &sources.iter().map(|&s| s as u32).collect(),
            )),
            operation: Some(ConnectionOperation::Connect),
            disposition: None,
        };
        let outcome =
            apply_matrix_connections(&mut tree, matrix, Some(vec![connection]), true).unwrap();
        assert_eq!(1, outcome.notifications.len());
        match &outcome.notifications[0] {
            Notification::MatrixChanged { targets, .. } => assert_eq!(vec![1], *targets),
            _ => panic!("expected MatrixChanged"),
        }
    }

    #[test]
    fn matrix_out_of_range_target_is_an_error() {
        use crate::glow::{MatrixAddressingMode, MatrixType};
        let mut tree = Tree::new();
        let root = tree.root();
        let matrix = tree.add_matrix(
            root,
            1,
            "router",
            MatrixType::OneToN,
            MatrixAddressingMode::Linear,
            2,
            2,
        );
        let connection = Connection {
            target: 9,
            sources: None,
            operation: None,
            disposition: None,
        };
        assert!(
            apply_matrix_connections(&mut tree, matrix, Some(vec![connection]), true).is_err()
        );
    }
}
