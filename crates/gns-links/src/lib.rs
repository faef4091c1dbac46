//! Two-phase validation for batched link operations.
//!
//! The GNS3 REST API has no transactions, so batch topology mutations are
//! gated by a pure validation pass: build the set of ports in use from the
//! current links, then fold every requested operation through it with
//! simulated state. Only if the whole batch validates does the caller apply
//! the operations (in list order) against the controller. Rollback after a
//! partial failure would itself be non-atomic; a vetoed batch performs no
//! side effects at all, and a rare mid-batch API failure is reported, not
//! rolled back.

#![forbid(unsafe_code)]

use gns_proto::{ErrorCode, Link, Node};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

// ─── Operations ───────────────────────────────────────────────────────────────

/// Adapter selector: by number or by port name (`"eth0"`, `"Gi0/0"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdapterRef {
    Number(u32),
    Name(String),
}

/// One side of a requested connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Node name (case-sensitive).
    pub node: String,
    pub adapter: AdapterRef,
    /// Port number within the adapter; ignored when the adapter is named,
    /// since a port name identifies both coordinates.
    #[serde(default)]
    pub port: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum LinkOp {
    Connect { a: EndpointSpec, b: EndpointSpec },
    Disconnect { link_id: String },
}

/// A fully resolved endpoint, echoing both adapter forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    pub node_id: String,
    pub node_name: String,
    pub adapter_number: u32,
    pub port_number: u32,
    pub adapter_name: String,
}

/// The validated plan for one operation, ready for phase 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PlannedOp {
    Connect {
        a: ResolvedEndpoint,
        b: ResolvedEndpoint,
    },
    Disconnect {
        link_id: String,
    },
}

// ─── Validation failure ───────────────────────────────────────────────────────

/// Why phase 1 vetoed the batch. Carries the failing index and enough
/// context for the caller to correct the request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation {operation_index}: {error}")]
pub struct ValidationFailure {
    pub error: String,
    pub error_code: ErrorCode,
    pub operation_index: usize,
    pub context: Map<String, Value>,
}

impl ValidationFailure {
    fn new(index: usize, code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_code: code,
            operation_index: index,
            context: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

// ─── Port usage set ───────────────────────────────────────────────────────────

/// Ports currently occupied by links, keyed by `(node_id, adapter, port)`.
///
/// Invariant: each triple appears at most once. The value records which link
/// occupies the port so conflicts can name the offender.
#[derive(Debug, Default)]
pub struct PortUsageSet {
    used: HashMap<(String, u32, u32), String>,
}

impl PortUsageSet {
    pub fn from_links(links: &[Link]) -> Self {
        let mut set = Self::default();
        for link in links {
            for ep in &link.endpoints {
                set.used.insert(
                    (ep.node_id.clone(), ep.adapter_number, ep.port_number),
                    link.link_id.clone(),
                );
            }
        }
        set
    }

    /// Returns the occupying link id, if any.
    pub fn occupant(&self, node_id: &str, adapter: u32, port: u32) -> Option<&str> {
        self.used
            .get(&(node_id.to_string(), adapter, port))
            .map(String::as_str)
    }

    fn occupy(&mut self, ep: &ResolvedEndpoint, link_id: &str) {
        self.used.insert(
            (ep.node_id.clone(), ep.adapter_number, ep.port_number),
            link_id.to_string(),
        );
    }

    fn release_link(&mut self, link_id: &str) {
        self.used.retain(|_, v| v != link_id);
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

// ─── Phase 1 ──────────────────────────────────────────────────────────────────

/// Validate a batch against the current topology.
///
/// Pure: no I/O, no side effects. On success returns the planned operations
/// in list order; on the first failure returns the veto and the caller must
/// apply nothing.
pub fn validate_operations(
    nodes: &[Node],
    links: &[Link],
    ops: &[LinkOp],
) -> Result<Vec<PlannedOp>, ValidationFailure> {
    let mut usage = PortUsageSet::from_links(links);
    let known_links: HashMap<&str, &Link> =
        links.iter().map(|l| (l.link_id.as_str(), l)).collect();
    let mut planned = Vec::with_capacity(ops.len());

    for (index, op) in ops.iter().enumerate() {
        match op {
            LinkOp::Connect { a, b } => {
                let ra = resolve_endpoint(nodes, a, index)?;
                let rb = resolve_endpoint(nodes, b, index)?;

                for ep in [&ra, &rb] {
                    if let Some(link_id) = usage.occupant(&ep.node_id, ep.adapter_number, ep.port_number)
                    {
                        return Err(ValidationFailure::new(
                            index,
                            ErrorCode::PortInUse,
                            format!(
                                "{} {} is already in use",
                                ep.node_name, ep.adapter_name
                            ),
                        )
                        .with("node", json!(ep.node_name))
                        .with("adapter_number", json!(ep.adapter_number))
                        .with("port_number", json!(ep.port_number))
                        .with("occupied_by_link", json!(link_id)));
                    }
                    // Occupy as we go so the second endpoint of a self-loop
                    // and later ops in the batch see the simulated state.
                    usage.occupy(ep, "(pending)");
                }

                planned.push(PlannedOp::Connect { a: ra, b: rb });
            }
            LinkOp::Disconnect { link_id } => {
                if !known_links.contains_key(link_id.as_str()) {
                    return Err(ValidationFailure::new(
                        index,
                        ErrorCode::LinkNotFound,
                        format!("link '{link_id}' does not exist"),
                    )
                    .with(
                        "available_links",
                        json!(links.iter().map(|l| l.link_id.as_str()).collect::<Vec<_>>()),
                    ));
                }
                usage.release_link(link_id);
                planned.push(PlannedOp::Disconnect {
                    link_id: link_id.clone(),
                });
            }
        }
    }

    Ok(planned)
}

/// Resolve an endpoint spec against the node list, recording both adapter
/// forms. Name and number resolution agree: resolving the returned
/// `adapter_name` yields the same coordinates back.
fn resolve_endpoint(
    nodes: &[Node],
    spec: &EndpointSpec,
    index: usize,
) -> Result<ResolvedEndpoint, ValidationFailure> {
    let node = nodes.iter().find(|n| n.name == spec.node).ok_or_else(|| {
        ValidationFailure::new(
            index,
            ErrorCode::NodeNotFound,
            format!("node '{}' not found", spec.node),
        )
        .with(
            "available_nodes",
            json!(nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>()),
        )
    })?;

    let port = match &spec.adapter {
        AdapterRef::Name(name) => node.port_by_name(name).ok_or_else(|| {
            ValidationFailure::new(
                index,
                ErrorCode::InvalidAdapter,
                format!("node '{}' has no adapter named '{name}'", node.name),
            )
            .with(
                "available_adapters",
                json!(node.ports.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()),
            )
        })?,
        AdapterRef::Number(adapter_number) => {
            if !node.ports.iter().any(|p| p.adapter_number == *adapter_number) {
                return Err(ValidationFailure::new(
                    index,
                    ErrorCode::InvalidAdapter,
                    format!(
                        "node '{}' has no adapter {adapter_number}",
                        node.name
                    ),
                )
                .with(
                    "available_adapters",
                    json!(
                        node.ports
                            .iter()
                            .map(|p| p.adapter_number)
                            .collect::<std::collections::BTreeSet<_>>()
                    ),
                ));
            }
            node.port(*adapter_number, spec.port).ok_or_else(|| {
                ValidationFailure::new(
                    index,
                    ErrorCode::InvalidPort,
                    format!(
                        "node '{}' adapter {adapter_number} has no port {}",
                        node.name, spec.port
                    ),
                )
                .with(
                    "available_ports",
                    json!(
                        node.ports
                            .iter()
                            .filter(|p| p.adapter_number == *adapter_number)
                            .map(|p| p.port_number)
                            .collect::<Vec<_>>()
                    ),
                )
            })?
        }
    };

    Ok(ResolvedEndpoint {
        node_id: node.node_id.clone(),
        node_name: node.name.clone(),
        adapter_number: port.adapter_number,
        port_number: port.port_number,
        adapter_name: port.name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gns_proto::{ConsoleType, LinkEndpoint, NodePort, NodeStatus};

    fn port(name: &str, adapter: u32, number: u32) -> NodePort {
        NodePort {
            name: name.to_string(),
            short_name: None,
            adapter_number: adapter,
            port_number: number,
        }
    }

    fn node(id: &str, name: &str, ports: Vec<NodePort>) -> Node {
        Node {
            node_id: id.to_string(),
            name: name.to_string(),
            node_type: "qemu".to_string(),
            status: NodeStatus::Started,
            console: Some(5000),
            console_type: ConsoleType::Telnet,
            console_host: Some("127.0.0.1".to_string()),
            x: 0,
            y: 0,
            z: 1,
            locked: false,
            ports,
        }
    }

    fn router(id: &str, name: &str) -> Node {
        node(
            id,
            name,
            vec![
                port("GigabitEthernet0/0", 0, 0),
                port("GigabitEthernet0/1", 0, 1),
                port("GigabitEthernet1/0", 1, 0),
            ],
        )
    }

    fn link(id: &str, a: (&str, u32, u32), b: (&str, u32, u32)) -> Link {
        Link {
            link_id: id.to_string(),
            endpoints: vec![
                LinkEndpoint {
                    node_id: a.0.to_string(),
                    adapter_number: a.1,
                    port_number: a.2,
                },
                LinkEndpoint {
                    node_id: b.0.to_string(),
                    adapter_number: b.1,
                    port_number: b.2,
                },
            ],
        }
    }

    fn connect(a: &str, aa: AdapterRef, ap: u32, b: &str, ba: AdapterRef, bp: u32) -> LinkOp {
        LinkOp::Connect {
            a: EndpointSpec {
                node: a.to_string(),
                adapter: aa,
                port: ap,
            },
            b: EndpointSpec {
                node: b.to_string(),
                adapter: ba,
                port: bp,
            },
        }
    }

    #[test]
    fn test_connect_free_ports_validates() {
        let nodes = vec![router("a", "A"), router("c", "C")];
        let ops = vec![connect(
            "A",
            AdapterRef::Number(0),
            1,
            "C",
            AdapterRef::Number(0),
            0,
        )];
        let planned = validate_operations(&nodes, &[], &ops).expect("valid");
        assert_eq!(planned.len(), 1);
        match &planned[0] {
            PlannedOp::Connect { a, b } => {
                assert_eq!(a.node_id, "a");
                assert_eq!(a.adapter_name, "GigabitEthernet0/1");
                assert_eq!(b.port_number, 0);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_conflict_with_existing_link_vetoes_batch() {
        // Mirror of the two-op scenario: first op is fine, second collides
        // with an existing link; nothing may be applied.
        let nodes = vec![router("a", "A"), router("b", "B"), router("c", "C")];
        let links = vec![link("l-1", ("a", 0, 0), ("b", 0, 0))];
        let ops = vec![
            connect("A", AdapterRef::Number(0), 1, "C", AdapterRef::Number(0), 0),
            connect("A", AdapterRef::Number(0), 0, "C", AdapterRef::Number(0), 1),
        ];
        let failure = validate_operations(&nodes, &links, &ops).expect_err("conflict");
        assert_eq!(failure.error_code, ErrorCode::PortInUse);
        assert_eq!(failure.operation_index, 1);
        assert_eq!(failure.context["occupied_by_link"], json!("l-1"));
    }

    #[test]
    fn test_intra_batch_conflict_detected() {
        let nodes = vec![router("a", "A"), router("b", "B"), router("c", "C")];
        let ops = vec![
            connect("A", AdapterRef::Number(0), 0, "B", AdapterRef::Number(0), 0),
            connect("A", AdapterRef::Number(0), 0, "C", AdapterRef::Number(0), 0),
        ];
        let failure = validate_operations(&nodes, &[], &ops).expect_err("conflict");
        assert_eq!(failure.error_code, ErrorCode::PortInUse);
        assert_eq!(failure.operation_index, 1);
    }

    #[test]
    fn test_disconnect_frees_port_for_reuse_in_batch() {
        let nodes = vec![router("a", "A"), router("b", "B"), router("c", "C")];
        let links = vec![link("l-1", ("a", 0, 0), ("b", 0, 0))];
        let ops = vec![
            LinkOp::Disconnect {
                link_id: "l-1".to_string(),
            },
            connect("A", AdapterRef::Number(0), 0, "C", AdapterRef::Number(0), 0),
        ];
        let planned = validate_operations(&nodes, &links, &ops).expect("valid");
        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn test_unknown_node_lists_alternatives() {
        let nodes = vec![router("a", "A")];
        let ops = vec![connect(
            "Z",
            AdapterRef::Number(0),
            0,
            "A",
            AdapterRef::Number(0),
            0,
        )];
        let failure = validate_operations(&nodes, &[], &ops).expect_err("missing node");
        assert_eq!(failure.error_code, ErrorCode::NodeNotFound);
        assert_eq!(failure.context["available_nodes"], json!(["A"]));
    }

    #[test]
    fn test_adapter_by_name_resolves() {
        let nodes = vec![router("a", "A"), router("b", "B")];
        let ops = vec![connect(
            "A",
            AdapterRef::Name("GigabitEthernet1/0".to_string()),
            0,
            "B",
            AdapterRef::Number(0),
            0,
        )];
        let planned = validate_operations(&nodes, &[], &ops).expect("valid");
        match &planned[0] {
            PlannedOp::Connect { a, .. } => {
                assert_eq!(a.adapter_number, 1);
                assert_eq!(a.port_number, 0);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_adapter_resolution_is_an_involution() {
        // For every named port, resolving by number and re-resolving the
        // echoed name agree on coordinates.
        let n = router("a", "A");
        let nodes = vec![n.clone(), router("b", "B")];
        for p in &n.ports {
            let by_number = validate_operations(
                &nodes,
                &[],
                &[connect(
                    "A",
                    AdapterRef::Number(p.adapter_number),
                    p.port_number,
                    "B",
                    AdapterRef::Number(0),
                    0,
                )],
            )
            .expect("valid by number");
            let PlannedOp::Connect { a: ra, .. } = &by_number[0] else {
                panic!("expected connect");
            };
            let by_name = validate_operations(
                &nodes,
                &[],
                &[connect(
                    "A",
                    AdapterRef::Name(ra.adapter_name.clone()),
                    0,
                    "B",
                    AdapterRef::Number(0),
                    0,
                )],
            )
            .expect("valid by name");
            let PlannedOp::Connect { a: rb, .. } = &by_name[0] else {
                panic!("expected connect");
            };
            assert_eq!(ra, rb);
        }
    }

    #[test]
    fn test_invalid_adapter_and_port_codes() {
        let nodes = vec![router("a", "A"), router("b", "B")];
        let bad_adapter = validate_operations(
            &nodes,
            &[],
            &[connect("A", AdapterRef::Number(9), 0, "B", AdapterRef::Number(0), 0)],
        )
        .expect_err("bad adapter");
        assert_eq!(bad_adapter.error_code, ErrorCode::InvalidAdapter);

        let bad_port = validate_operations(
            &nodes,
            &[],
            &[connect("A", AdapterRef::Number(0), 9, "B", AdapterRef::Number(0), 0)],
        )
        .expect_err("bad port");
        assert_eq!(bad_port.error_code, ErrorCode::InvalidPort);

        let bad_name = validate_operations(
            &nodes,
            &[],
            &[connect(
                "A",
                AdapterRef::Name("eth42".to_string()),
                0,
                "B",
                AdapterRef::Number(0),
                0,
            )],
        )
        .expect_err("bad adapter name");
        assert_eq!(bad_name.error_code, ErrorCode::InvalidAdapter);
    }

    #[test]
    fn test_disconnect_unknown_link() {
        let failure = validate_operations(
            &[],
            &[],
            &[LinkOp::Disconnect {
                link_id: "l-9".to_string(),
            }],
        )
        .expect_err("missing link");
        assert_eq!(failure.error_code, ErrorCode::LinkNotFound);
        assert_eq!(failure.operation_index, 0);
    }

    #[test]
    fn test_port_usage_set_invariant() {
        let links = vec![
            link("l-1", ("a", 0, 0), ("b", 0, 0)),
            link("l-2", ("a", 0, 1), ("b", 0, 1)),
        ];
        let set = PortUsageSet::from_links(&links);
        assert_eq!(set.len(), 4);
        assert_eq!(set.occupant("a", 0, 0), Some("l-1"));
        assert_eq!(set.occupant("a", 0, 1), Some("l-2"));
        assert_eq!(set.occupant("a", 1, 0), None);
    }

    #[test]
    fn test_op_serde_shape() {
        let op: LinkOp = serde_json::from_value(json!({
            "action": "connect",
            "a": { "node": "A", "adapter": "eth0" },
            "b": { "node": "B", "adapter": 0, "port": 1 }
        }))
        .expect("deserialize");
        match op {
            LinkOp::Connect { a, b } => {
                assert_eq!(a.adapter, AdapterRef::Name("eth0".to_string()));
                assert_eq!(a.port, 0);
                assert_eq!(b.adapter, AdapterRef::Number(0));
                assert_eq!(b.port, 1);
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }
}
