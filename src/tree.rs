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

//! The live, mutable control tree: an arena of elements addressed by
//! [`ElementId`] handles rather than the parent/child `Rc`/`Weak`
//! graphs the wire types would otherwise need. Every wire-level type
//! (`Node`, `Parameter`, `Matrix`, ...) lives in `glow`; this module
//! holds the server's own in-memory state and the logic to render it
//! back out as those wire types on demand.

use std::collections::{BTreeMap, BTreeSet};

use rasn::types::ObjectIdentifier;

use crate::glow::{
    Connection, ConnectionCollection, ConnectionDisposition, ConnectionOperation, Element,
    ElementCollection, Matrix, MatrixAddressingMode, MatrixContents, MatrixType, Node,
    NodeContents, PackedNumbers, Parameter, ParameterAccess, ParameterContents, ParameterType,
    QualifiedMatrix, QualifiedNode, QualifiedParameter, RootElement, Value,
};

/// Arena index. `0` is reserved for the implicit, unaddressable root
/// that owns the top-level elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(u32);

const ROOT: ElementId = ElementId(0);

#[derive(Debug, Clone)]
struct NodeState {
    identifier: String,
    description: Option<String>,
    is_root: bool,
    is_online: bool,
}

#[derive(Debug, Clone)]
struct ParameterState {
    identifier: String,
    description: Option<String>,
    value: Option<Value>,
    minimum: Option<Value>,
    maximum: Option<Value>,
    access: ParameterAccess,
    r#type: Option<ParameterType>,
    format: Option<String>,
    enumeration: Option<String>,
    factor: Option<i32>,
    is_online: bool,
    stream_identifier: Option<i32>,
}

#[derive(Debug, Clone)]
struct MatrixState {
    identifier: String,
    description: Option<String>,
    r#type: MatrixType,
    addressing_mode: MatrixAddressingMode,
    targets: Vec<i32>,
    sources: Vec<i32>,
    maximum_total_connects: Option<i32>,
    maximum_connects_per_target: Option<i32>,
    /// target number -> connected source numbers.
    connections: BTreeMap<i32, BTreeSet<i32>>,
}

#[derive(Debug, Clone)]
enum Kind {
    Node(NodeState),
    Parameter(ParameterState),
    Matrix(MatrixState),
}

#[derive(Debug, Clone)]
struct Entry {
    parent: ElementId,
    number: i32,
    children: Vec<ElementId>,
    kind: Kind,
}

/// The outcome of a successful mutation, used by the dispatcher to
/// decide which server event to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEffect {
    ValueChanged {
        previous: Option<Value>,
    },
    MatrixConnected {
        target: i32,
        sources: BTreeSet<i32>,
    },
    MatrixDisconnected {
        target: i32,
        sources: BTreeSet<i32>,
    },
    /// The mutation was a well-formed request the tree nonetheless
    /// declined to apply (write access denied, unknown target/source).
    /// No event should fan out.
    NoOp,
}

pub struct Tree {
    entries: Vec<Option<Entry>>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Tree {
            entries: vec![Some(Entry {
                parent: ROOT,
                number: 0,
                children: Vec::new(),
                kind: Kind::Node(NodeState {
                    identifier: String::new(),
                    description: None,
                    is_root: true,
                    is_online: true,
                }),
            })],
        }
    }

    fn entry(&self, id: ElementId) -> Option<&Entry> {
        self.entries.get(id.0 as usize).and_then(|e| e.as_ref())
    }

    fn entry_mut(&mut self, id: ElementId) -> Option<&mut Entry> {
        self.entries.get_mut(id.0 as usize).and_then(|e| e.as_mut())
    }

    fn insert(&mut self, parent: ElementId, number: i32, kind: Kind) -> ElementId {
        let id = ElementId(self.entries.len() as u32);
        self.entries.push(Some(Entry {
            parent,
            number,
            children: Vec::new(),
            kind,
        }));
        if let Some(entry) = self.entry_mut(parent) {
            entry.children.push(id);
        }
        id
    }

    pub fn add_node(
        &mut self,
        parent: ElementId,
        number: i32,
        identifier: impl Into<String>,
        description: Option<String>,
    ) -> ElementId {
        self.insert(
            parent,
            number,
            Kind::Node(NodeState {
                identifier: identifier.into(),
                description,
                is_root: false,
                is_online: true,
            }),
        )
    }

    pub fn add_parameter(
        &mut self,
        parent: ElementId,
        number: i32,
        identifier: impl Into<String>,
        access: ParameterAccess,
        value: Option<Value>,
    ) -> ElementId {
        self.insert(
            parent,
            number,
            Kind::Parameter(ParameterState {
                identifier: identifier.into(),
                description: None,
                value,
                minimum: None,
                maximum: None,
                access,
                r#type: None,
                format: None,
                enumeration: None,
                factor: None,
                is_online: true,
                stream_identifier: None,
            }),
        )
    }

    /// A parameter streamed outside the directory/subscription path
    /// (spec.md §4.4: GetDirectory auto-subscribes to a streamed
    /// parameter's *children* rather than the parameter itself).
    pub fn set_stream_identifier(&mut self, id: ElementId, stream_identifier: i32) {
        if let Some(Entry {
            kind: Kind::Parameter(state),
            ..
        }) = self.entry_mut(id)
        {
            state.stream_identifier = Some(stream_identifier);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_matrix(
        &mut self,
        parent: ElementId,
        number: i32,
        identifier: impl Into<String>,
        r#type: MatrixType,
        addressing_mode: MatrixAddressingMode,
        target_count: usize,
        source_count: usize,
    ) -> ElementId {
        self.insert(
            parent,
            number,
            Kind::Matrix(MatrixState {
                identifier: identifier.into(),
                description: None,
                r#type,
                addressing_mode,
                targets: (0..target_count as i32).collect(),
                sources: (0..source_count as i32).collect(),
                maximum_total_connects: None,
                maximum_connects_per_target: None,
                connections: BTreeMap::new(),
            }),
        )
    }

    pub fn root(&self) -> ElementId {
        ROOT
    }

    pub fn children(&self, id: ElementId) -> &[ElementId] {
        self.entry(id).map(|e| e.children.as_slice()).unwrap_or(&[])
    }

    pub fn is_parameter(&self, id: ElementId) -> bool {
        matches!(self.entry(id).map(|e| &e.kind), Some(Kind::Parameter(_)))
    }

    pub fn is_matrix(&self, id: ElementId) -> bool {
        matches!(self.entry(id).map(|e| &e.kind), Some(Kind::Matrix(_)))
    }

    /// `true` for a parameter whose value arrives out-of-band on a
    /// stream rather than through GetDirectory/Subscribe.
    pub fn is_stream_parameter(&self, id: ElementId) -> bool {
        matches!(
            self.entry(id).map(|e| &e.kind),
            Some(Kind::Parameter(ParameterState {
                stream_identifier: Some(_),
                ..
            }))
        )
    }

    pub fn child_by_number(&self, parent: ElementId, number: i32) -> Option<ElementId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.entry(c).map(|e| e.number) == Some(number))
    }

    pub fn matrix_target_count(&self, id: ElementId) -> Option<i32> {
        match self.entry(id).map(|e| &e.kind) {
            Some(Kind::Matrix(state)) => Some(state.targets.len() as i32),
            _ => None,
        }
    }

    /// The chain of local numbers from the root down to `id`,
    /// excluding the implicit root itself.
    pub fn path_of(&self, id: ElementId) -> Vec<i32> {
        let mut path = Vec::new();
        let mut current = id;
        while current != ROOT {
            let Some(entry) = self.entry(current) else {
                break;
            };
            path.push(entry.number);
            current = entry.parent;
        }
        path.reverse();
        path
    }

    pub fn get_element_by_path(&self, path: &[i32]) -> Option<ElementId> {
        let mut current = ROOT;
        for &number in path {
            current = self
                .children(current)
                .iter()
                .copied()
                .find(|child| self.entry(*child).map(|e| e.number) == Some(number))?;
        }
        Some(current)
    }

    fn oid_of(path: &[i32]) -> ObjectIdentifier {
        ObjectIdentifier::new(path.iter().map(|&n| n as u32).collect())
            .expect("a resolved element path is always non-empty and non-negative")
    }

    // ---- value / matrix mutation ----

    pub fn parameter_value(&self, id: ElementId) -> Option<&Value> {
        match self.entry(id).map(|e| &e.kind) {
            Some(Kind::Parameter(p)) => p.value.as_ref(),
            _ => None,
        }
    }

    /// Applies a client-requested value write. Returns `NoOp` (no
    /// event fan-out) when the parameter does not permit writes,
    /// matching the silent-failure behaviour spec.md mandates rather
    /// than surfacing a protocol error for a access violation.
    pub fn set_parameter_value(&mut self, id: ElementId, value: Value) -> MutationEffect {
        let Some(entry) = self.entry_mut(id) else {
            return MutationEffect::NoOp;
        };
        let Kind::Parameter(state) = &mut entry.kind else {
            return MutationEffect::NoOp;
        };
        if !state.access.permits_write() {
            return MutationEffect::NoOp;
        }
        let previous = state.value.replace(value);
        MutationEffect::ValueChanged { previous }
    }

    /// Applies a connection-collection mutation for one target, per
    /// spec.md §4.4's absolute/connect/disconnect semantics. Matrix
    /// type (one-to-N vs one-to-one) is intentionally not enforced
    /// here — see DESIGN.md.
    pub fn apply_connection(
        &mut self,
        matrix: ElementId,
        target: i32,
        sources: &BTreeSet<i32>,
        operation: ConnectionOperation,
    ) -> MutationEffect {
        let Some(entry) = self.entry_mut(matrix) else {
            return MutationEffect::NoOp;
        };
        let Kind::Matrix(state) = &mut entry.kind else {
            return MutationEffect::NoOp;
        };
        if !state.targets.contains(&target) {
            return MutationEffect::NoOp;
        }
        if !sources.iter().all(|s| state.sources.contains(s)) {
            return MutationEffect::NoOp;
        }

        let current = state.connections.entry(target).or_default();
        match operation {
            ConnectionOperation::Absolute => {
                *current = sources.clone();
                MutationEffect::MatrixConnected {
                    target,
                    sources: sources.clone(),
                }
            }
            ConnectionOperation::Connect => {
                current.extend(sources.iter().copied());
                MutationEffect::MatrixConnected {
                    target,
                    sources: sources.clone(),
                }
            }
            ConnectionOperation::Disconnect => {
                for s in sources {
                    current.remove(s);
                }
                MutationEffect::MatrixDisconnected {
                    target,
                    sources: sources.clone(),
                }
            }
        }
    }

    // ---- wire rendering ----

    /// Renders `id` and its direct children as a relative (number
    /// tagged) `Element`, the shape used inside a parent's
    /// `ElementCollection` and for unqualified GetDirectory responses.
    pub fn to_element(&self, id: ElementId, include_children: bool) -> Option<Element> {
        let entry = self.entry(id)?;
        match &entry.kind {
            Kind::Node(state) => Some(Element::Node(Node {
                number: entry.number,
                contents: Some(NodeContents {
                    identifier: Some(state.identifier.clone()),
                    description: state.description.clone(),
                    is_root: Some(state.is_root),
                    is_online: Some(state.is_online),
                    schema_identifiers: None,
                    template_reference: None,
                }),
                children: include_children
                    .then(|| self.children_as_collection(id))
                    .flatten(),
            })),
            Kind::Parameter(state) => Some(Element::Parameter(Parameter {
                number: entry.number,
                contents: Some(self.parameter_contents(state)),
                children: include_children
                    .then(|| self.children_as_collection(id))
                    .flatten(),
            })),
            Kind::Matrix(state) => Some(Element::Matrix(Matrix {
                number: entry.number,
                contents: Some(self.matrix_contents(state)),
                children: include_children
                    .then(|| self.children_as_collection(id))
                    .flatten(),
                targets: None,
                sources: None,
                connections: None,
            })),
        }
    }

    /// Renders `id` as a fully path-qualified `RootElement`, the shape
    /// used for Subscribe-driven value-change notifications and
    /// qualified GetDirectory responses. `include_children` embeds
    /// one trimmed level of `id`'s own children, as a GetDirectory
    /// response does; a plain value/connection notification passes
    /// `false`.
    pub fn to_qualified(&self, id: ElementId, include_children: bool) -> Option<RootElement> {
        let entry = self.entry(id)?;
        let path = Self::oid_of(&self.path_of(id));
        let children = include_children
            .then(|| self.children_as_collection(id))
            .flatten();
        match &entry.kind {
            Kind::Node(state) => Some(RootElement::QualifiedNode(QualifiedNode {
                path,
                contents: Some(NodeContents {
                    identifier: Some(state.identifier.clone()),
                    description: state.description.clone(),
                    is_root: Some(state.is_root),
                    is_online: Some(state.is_online),
                    schema_identifiers: None,
                    template_reference: None,
                }),
                children,
            })),
            Kind::Parameter(state) => Some(RootElement::QualifiedParameter(QualifiedParameter {
                path,
                contents: Some(self.parameter_contents(state)),
                children,
            })),
            Kind::Matrix(state) => Some(RootElement::QualifiedMatrix(QualifiedMatrix {
                path,
                contents: Some(self.matrix_contents(state)),
                children,
                targets: None,
                sources: None,
                connections: Some(self.connections_of(state)),
            })),
        }
    }

    /// Wraps `leaf` (which must already carry `id`'s own number) in a
    /// chain of single-child `Node`s from the root down to `id`'s
    /// parent — the "tree-branch" response shape spec.md §4.4 uses to
    /// mirror an unqualified request's own addressing form.
    pub fn tree_branch(&self, id: ElementId, leaf: Element) -> RootElement {
        let path = self.path_of(id);
        let mut node = leaf;
        for &number in path[..path.len().saturating_sub(1)].iter().rev() {
            node = Element::Node(Node {
                number,
                contents: None,
                children: Some(ElementCollection(vec![node])),
            });
        }
        RootElement::Element(node)
    }

    /// The response to a value write: the updated parameter, shaped
    /// to match the request (qualified or tree-branch).
    pub fn parameter_response(&self, id: ElementId, qualified: bool) -> Option<RootElement> {
        if qualified {
            self.to_qualified(id, false)
        } else {
            Some(self.tree_branch(id, self.to_element(id, false)?))
        }
    }

    /// Only the touched targets' *resulting* connections, not the
    /// matrix's full connection table — spec.md §4.4: "the response
    /// carries each touched target with its resulting sources".
    fn matrix_connections_subset(&self, id: ElementId, targets: &[i32]) -> Option<ConnectionCollection> {
        let Kind::Matrix(state) = &self.entry(id)?.kind else {
            return None;
        };
        Some(ConnectionCollection(
            targets
                .iter()
                .filter_map(|target| {
                    let sources = state.connections.get(target)?;
                    // A target fully disconnected down to no sources
                    // is still a touched target that must appear in
                    // the response (spec.md §4.4); `PackedNumbers`
                    // can only encode a non-empty OID, so represent
                    // "no sources" as an absent `sources` field
                    // rather than an empty one.
                    let sources = if sources.is_empty() {
                        None
                    } else {
                        let sources_u32: std::collections::BTreeSet<u32> =
                            sources.iter().map(|&s| s as u32).collect();
                        Some(PackedNumbers::from_sources(&sources_u32))
                    };
                    Some(Connection {
                        target: *target,
                        sources,
                        operation: Some(ConnectionOperation::Absolute),
                        disposition: Some(ConnectionDisposition::Modified),
                    })
                })
                .collect(),
        ))
    }

    /// The response to a connection mutation: the touched targets
    /// with their resulting sources, shaped to match the request.
    pub fn matrix_response(&self, id: ElementId, targets: &[i32], qualified: bool) -> Option<RootElement> {
        let connections = self.matrix_connections_subset(id, targets)?;
        if qualified {
            let path = Self::oid_of(&self.path_of(id));
            Some(RootElement::QualifiedMatrix(QualifiedMatrix {
                path,
                contents: None,
                children: None,
                targets: None,
                sources: None,
                connections: Some(connections),
            }))
        } else {
            let number = self.entry(id)?.number;
            let leaf = Element::Matrix(Matrix {
                number,
                contents: None,
                children: None,
                targets: None,
                sources: None,
                connections: Some(connections),
            });
            Some(self.tree_branch(id, leaf))
        }
    }

    fn children_as_collection(&self, id: ElementId) -> Option<ElementCollection> {
        let children = self.children(id);
        if children.is_empty() {
            return None;
        }
        Some(ElementCollection(
            children
                .iter()
                .filter_map(|c| self.to_element(*c, false))
                .collect(),
        ))
    }

    fn parameter_contents(&self, state: &ParameterState) -> ParameterContents {
        ParameterContents {
            identifier: Some(state.identifier.clone()),
            description: state.description.clone(),
            value: state.value.clone(),
            minimum: state.minimum.clone().map(to_min_max),
            maximum: state.maximum.clone().map(to_min_max),
            access: Some(state.access),
            format: state.format.clone(),
            enumeration: state.enumeration.clone(),
            factor: state.factor,
            is_online: Some(state.is_online),
            formula: None,
            step: None,
            default: None,
            r#type: state.r#type,
            stream_identifier: None,
            enum_map: None,
            stream_descriptor: None,
            schema_identifiers: None,
            template_reference: None,
        }
    }

    fn matrix_contents(&self, state: &MatrixState) -> MatrixContents {
        MatrixContents {
            identifier: state.identifier.clone(),
            description: state.description.clone(),
            r#type: Some(state.r#type),
            addressing_mode: Some(state.addressing_mode),
            target_count: state.targets.len() as i32,
            source_count: state.sources.len() as i32,
            maximum_total_connects: state.maximum_total_connects,
            maximum_connects_per_target: state.maximum_connects_per_target,
            parameters_location: None,
            gain_parameter_number: None,
            labels: None,
            schema_identifiers: None,
            template_reference: None,
        }
    }

    fn connections_of(&self, state: &MatrixState) -> crate::glow::ConnectionCollection {
        crate::glow::ConnectionCollection(
            state
                .connections
                .iter()
                .filter(|(_, sources)| !sources.is_empty())
                .map(|(&target, sources)| Connection {
                    target,
                    sources: Some(PackedNumbers::from_sources(sources)),
                    operation: Some(ConnectionOperation::Absolute),
                    disposition: Some(ConnectionDisposition::Modified),
                })
                .collect(),
        )
    }
}

fn to_min_max(value: Value) -> crate::glow::MinMax {
    use crate::glow::MinMax;
    match value {
        Value::Integer(i) => MinMax::Integer(i),
        Value::Real(r) => MinMax::Real(r),
        _ => MinMax::Null,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (Tree, ElementId, ElementId) {
        let mut tree = Tree::new();
        let root = tree.root();
        let device = tree.add_node(root, 1, "device", None);
        let gain = tree.add_parameter(
            device,
            1,
            "gain",
            ParameterAccess::ReadWrite,
            Some(Value::Integer(0)),
        );
        (tree, device, gain)
    }

    #[test]
    fn path_of_resolves_through_nesting() {
        let (tree, device, gain) = fixture();
        assert_eq!(vec![1], tree.path_of(device));
        assert_eq!(vec![1, 1], tree.path_of(gain));
        assert_eq!(
            Some(gain),
            tree.get_element_by_path(&tree.path_of(gain))
        );
    }

    #[test]
    fn write_access_gates_value_change() {
        let (mut tree, _device, gain) = fixture();
        let effect = tree.set_parameter_value(gain, Value::Integer(5));
        assert_eq!(
            MutationEffect::ValueChanged {
                previous: Some(Value::Integer(0))
            },
            effect
        );
        assert_eq!(Some(&Value::Integer(5)), tree.parameter_value(gain));
    }

    #[test]
    fn read_only_parameter_rejects_write_silently() {
        let mut tree = Tree::new();
        let root = tree.root();
        let ro = tree.add_parameter(
            root,
            1,
            "status",
            ParameterAccess::Read,
            Some(Value::Integer(1)),
        );
        let effect = tree.set_parameter_value(ro, Value::Integer(2));
        assert_eq!(MutationEffect::NoOp, effect);
        assert_eq!(Some(&Value::Integer(1)), tree.parameter_value(ro));
    }

    #[test]
    fn matrix_connect_then_disconnect() {
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
        let mut sources = BTreeSet::new();
        sources.insert(2);
        let effect =
            tree.apply_connection(matrix, 0, &sources, ConnectionOperation::Connect);
        assert_eq!(
            MutationEffect::MatrixConnected {
                target: 0,
                sources: sources.clone()
            },
            effect
        );

        let effect =
            tree.apply_connection(matrix, 0, &sources, ConnectionOperation::Disconnect);
        assert_eq!(
            MutationEffect::MatrixDisconnected {
                target: 0,
                sources
            },
            effect
        );
    }

    #[test]
    fn matrix_response_after_full_disconnect_has_no_sources_but_does_not_panic() {
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
        let mut sources = BTreeSet::new();
        sources.insert(2);
        tree.apply_connection(matrix, 0, &sources, ConnectionOperation::Connect);
        tree.apply_connection(matrix, 0, &sources, ConnectionOperation::Disconnect);

        let response = tree.matrix_response(matrix, &[0], true).unwrap();
        let RootElement::QualifiedMatrix(qm) = response else {
            panic!("expected a qualified matrix response");
        };
        let connections = qm.connections.unwrap().0;
        assert_eq!(1, connections.len());
        assert_eq!(0, connections[0].target);
        assert_eq!(None, connections[0].sources);
        assert_eq!(Some(ConnectionDisposition::Modified), connections[0].disposition);
    }

    #[test]
    fn matrix_rejects_unknown_source() {
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
        let mut sources = BTreeSet::new();
        sources.insert(99);
        let effect = tree.apply_connection(matrix, 0, &sources, ConnectionOperation::Connect);
        assert_eq!(MutationEffect::NoOp, effect);
    }
}
