//! # Graph Model - QVM Program Graphs on the Wire
//!
//! Immutable data types for QVM program graphs: nodes, the closed opcode
//! catalogue, capability kinds and sets, guard expressions, and the canonical
//! UTF-8 JSON wire format with strict and compatibility parse modes.
//!
//! This module enforces only value-range constraints (the opcode enum, guard
//! grammar shape) and structural well-formedness (maps and lists parse
//! cleanly). All richer invariants — topology, linearity, capability coverage,
//! firewall intent — are deliberately delegated to the static verifier so the
//! same graph value can describe both admissible and inadmissible programs.
//!
//! ## Wire Format
//!
//! ```text
//! version:   string, e.g. "0.1"
//! nodes:     ordered list of node records
//! metadata:  optional map (ignored by the core)
//! ```
//!
//! Node records carry `id`, `op`, `vqs`, `produces`, `args`, `caps`, `deps`,
//! and an optional `guard` of the form
//! `{kind: "true"|"false"|"eq"|"and", event?, value?, children?}`.
//! Strict mode rejects unknown fields; compatibility mode ignores them.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha3::{Digest, Sha3_256};
use std::collections::{HashMap, HashSet};

use crate::{QvmError, Result, VerificationError, VerificationRule};

/// Capability kinds a node may declare and a token may grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Allocate, free, and reset logical qubits
    #[serde(rename = "CAP_ALLOC")]
    Alloc,
    /// Apply unitary gates
    #[serde(rename = "CAP_COMPUTE")]
    Compute,
    /// Measure qubits and produce classical events
    #[serde(rename = "CAP_MEASURE")]
    Measure,
    /// Open and close inter-tenant entanglement channels
    #[serde(rename = "CAP_LINK")]
    Link,
    /// Teleportation-based two-qubit operations across channels
    #[serde(rename = "CAP_TELEPORT")]
    Teleport,
    /// Magic-state injection
    #[serde(rename = "CAP_MAGIC")]
    Magic,
    /// Administrative operations on the substrate itself
    #[serde(rename = "CAP_ADMIN")]
    Admin,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Alloc,
        Capability::Compute,
        Capability::Measure,
        Capability::Link,
        Capability::Teleport,
        Capability::Magic,
        Capability::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Alloc => "CAP_ALLOC",
            Capability::Compute => "CAP_COMPUTE",
            Capability::Measure => "CAP_MEASURE",
            Capability::Link => "CAP_LINK",
            Capability::Teleport => "CAP_TELEPORT",
            Capability::Magic => "CAP_MAGIC",
            Capability::Admin => "CAP_ADMIN",
        }
    }

    pub fn parse(name: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

bitflags! {
    /// Set of capability kinds, used for coverage checks
    ///
    /// All coverage checks are plain set operations on this value; there is no
    /// string or reflection lookup anywhere on the mediation path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapabilitySet: u8 {
        const ALLOC = 1 << 0;
        const COMPUTE = 1 << 1;
        const MEASURE = 1 << 2;
        const LINK = 1 << 3;
        const TELEPORT = 1 << 4;
        const MAGIC = 1 << 5;
        const ADMIN = 1 << 6;
    }
}

impl From<Capability> for CapabilitySet {
    fn from(cap: Capability) -> Self {
        match cap {
            Capability::Alloc => CapabilitySet::ALLOC,
            Capability::Compute => CapabilitySet::COMPUTE,
            Capability::Measure => CapabilitySet::MEASURE,
            Capability::Link => CapabilitySet::LINK,
            Capability::Teleport => CapabilitySet::TELEPORT,
            Capability::Magic => CapabilitySet::MAGIC,
            Capability::Admin => CapabilitySet::ADMIN,
        }
    }
}

impl CapabilitySet {
    /// Build a set from a slice of capability kinds
    pub fn from_caps(caps: &[Capability]) -> Self {
        caps.iter()
            .fold(CapabilitySet::empty(), |set, &cap| set | cap.into())
    }

    /// Expand back into the capability kinds this set contains
    pub fn to_caps(&self) -> Vec<Capability> {
        Capability::ALL
            .iter()
            .copied()
            .filter(|&cap| self.contains(cap.into()))
            .collect()
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "(none)");
        }
        let names: Vec<&str> = self.to_caps().iter().map(|c| c.as_str()).collect();
        write!(f, "{}", names.join("|"))
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_caps().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let caps = Vec::<Capability>::deserialize(deserializer)?;
        Ok(CapabilitySet::from_caps(&caps))
    }
}

/// Expected virtual-qubit list shape for an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VqShape {
    /// Exactly this many handle ids in `vqs`
    Exact(usize),
    /// One or more handle ids in `vqs`
    AtLeast(usize),
}

/// The closed QVM opcode catalogue
///
/// Any opcode absent from this enum is unknown and rejected at parse time.
/// The capability requirements and arity tables below reproduce the
/// instruction catalogue exactly; the dispatcher matches exhaustively on this
/// type, so adding a variant forces every consumer to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// Allocate `args.n` fresh logical qubits under `args.profile`
    #[serde(rename = "ALLOC_LQ")]
    AllocLq,
    /// Free all listed qubits, returning physical capacity to the pool
    #[serde(rename = "FREE_LQ")]
    FreeLq,
    /// Reset the qubit state to `Z0`; the handle stays live
    #[serde(rename = "RESET")]
    Reset,
    #[serde(rename = "APPLY_H")]
    ApplyH,
    #[serde(rename = "APPLY_S")]
    ApplyS,
    #[serde(rename = "APPLY_X")]
    ApplyX,
    #[serde(rename = "APPLY_Y")]
    ApplyY,
    #[serde(rename = "APPLY_Z")]
    ApplyZ,
    #[serde(rename = "APPLY_T")]
    ApplyT,
    /// Z-rotation by `args.theta` radians
    #[serde(rename = "APPLY_RZ")]
    ApplyRz,
    #[serde(rename = "APPLY_CNOT")]
    ApplyCnot,
    #[serde(rename = "APPLY_CZ")]
    ApplyCz,
    #[serde(rename = "APPLY_SWAP")]
    ApplySwap,
    /// Z-basis measurement; destroys the qubit, produces one event
    #[serde(rename = "MEASURE_Z")]
    MeasureZ,
    /// X-basis measurement; destroys the qubit, produces one event
    #[serde(rename = "MEASURE_X")]
    MeasureX,
    /// Bell-basis measurement; destroys both qubits, produces two events
    #[serde(rename = "MEASURE_BELL")]
    MeasureBell,
    /// Open an entanglement channel (`args.chan`, `args.peers`)
    #[serde(rename = "OPEN_CHAN")]
    OpenChan,
    /// Close the channel named by `args.chan`
    #[serde(rename = "CLOSE_CHAN")]
    CloseChan,
    /// Teleportation-based CNOT; requires a live channel across tenants
    #[serde(rename = "TELEPORT_CNOT")]
    TeleportCnot,
    /// Consume a magic state to enact a T gate fault-tolerantly
    #[serde(rename = "INJECT_T_STATE")]
    InjectTState,
    /// Epoch scheduling hint; no effect on state
    #[serde(rename = "FENCE_EPOCH")]
    FenceEpoch,
    /// Reversible-segment checkpoint marker (entry)
    #[serde(rename = "BEGIN_REV")]
    BeginRev,
    /// Reversible-segment checkpoint marker (exit)
    #[serde(rename = "END_REV")]
    EndRev,
}

impl OpCode {
    pub const ALL: [OpCode; 23] = [
        OpCode::AllocLq,
        OpCode::FreeLq,
        OpCode::Reset,
        OpCode::ApplyH,
        OpCode::ApplyS,
        OpCode::ApplyX,
        OpCode::ApplyY,
        OpCode::ApplyZ,
        OpCode::ApplyT,
        OpCode::ApplyRz,
        OpCode::ApplyCnot,
        OpCode::ApplyCz,
        OpCode::ApplySwap,
        OpCode::MeasureZ,
        OpCode::MeasureX,
        OpCode::MeasureBell,
        OpCode::OpenChan,
        OpCode::CloseChan,
        OpCode::TeleportCnot,
        OpCode::InjectTState,
        OpCode::FenceEpoch,
        OpCode::BeginRev,
        OpCode::EndRev,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::AllocLq => "ALLOC_LQ",
            OpCode::FreeLq => "FREE_LQ",
            OpCode::Reset => "RESET",
            OpCode::ApplyH => "APPLY_H",
            OpCode::ApplyS => "APPLY_S",
            OpCode::ApplyX => "APPLY_X",
            OpCode::ApplyY => "APPLY_Y",
            OpCode::ApplyZ => "APPLY_Z",
            OpCode::ApplyT => "APPLY_T",
            OpCode::ApplyRz => "APPLY_RZ",
            OpCode::ApplyCnot => "APPLY_CNOT",
            OpCode::ApplyCz => "APPLY_CZ",
            OpCode::ApplySwap => "APPLY_SWAP",
            OpCode::MeasureZ => "MEASURE_Z",
            OpCode::MeasureX => "MEASURE_X",
            OpCode::MeasureBell => "MEASURE_BELL",
            OpCode::OpenChan => "OPEN_CHAN",
            OpCode::CloseChan => "CLOSE_CHAN",
            OpCode::TeleportCnot => "TELEPORT_CNOT",
            OpCode::InjectTState => "INJECT_T_STATE",
            OpCode::FenceEpoch => "FENCE_EPOCH",
            OpCode::BeginRev => "BEGIN_REV",
            OpCode::EndRev => "END_REV",
        }
    }

    pub fn parse(name: &str) -> Option<OpCode> {
        OpCode::ALL.iter().copied().find(|op| op.as_str() == name)
    }

    /// Capability kinds this opcode requires from the submitting token
    pub fn required_caps(&self) -> CapabilitySet {
        match self {
            OpCode::AllocLq | OpCode::FreeLq | OpCode::Reset => CapabilitySet::ALLOC,
            OpCode::ApplyH
            | OpCode::ApplyS
            | OpCode::ApplyX
            | OpCode::ApplyY
            | OpCode::ApplyZ
            | OpCode::ApplyT
            | OpCode::ApplyRz
            | OpCode::ApplyCnot
            | OpCode::ApplyCz
            | OpCode::ApplySwap => CapabilitySet::COMPUTE,
            OpCode::MeasureZ | OpCode::MeasureX | OpCode::MeasureBell => CapabilitySet::MEASURE,
            OpCode::OpenChan | OpCode::CloseChan => CapabilitySet::LINK,
            OpCode::TeleportCnot => CapabilitySet::TELEPORT,
            OpCode::InjectTState => CapabilitySet::MAGIC,
            OpCode::FenceEpoch | OpCode::BeginRev | OpCode::EndRev => CapabilitySet::empty(),
        }
    }

    /// Expected shape of the node's `vqs` list
    pub fn vq_shape(&self) -> VqShape {
        match self {
            OpCode::AllocLq | OpCode::FreeLq => VqShape::AtLeast(1),
            OpCode::Reset
            | OpCode::ApplyH
            | OpCode::ApplyS
            | OpCode::ApplyX
            | OpCode::ApplyY
            | OpCode::ApplyZ
            | OpCode::ApplyT
            | OpCode::ApplyRz
            | OpCode::MeasureZ
            | OpCode::MeasureX
            | OpCode::InjectTState => VqShape::Exact(1),
            OpCode::ApplyCnot
            | OpCode::ApplyCz
            | OpCode::ApplySwap
            | OpCode::MeasureBell
            | OpCode::TeleportCnot => VqShape::Exact(2),
            OpCode::OpenChan | OpCode::CloseChan | OpCode::FenceEpoch | OpCode::BeginRev
            | OpCode::EndRev => VqShape::Exact(0),
        }
    }

    /// How many events the node must list in `produces`
    pub fn event_outputs(&self) -> usize {
        match self {
            OpCode::MeasureZ | OpCode::MeasureX => 1,
            OpCode::MeasureBell => 2,
            _ => 0,
        }
    }

    /// Introduces the handle ids listed in `vqs`
    pub fn introduces_vqs(&self) -> bool {
        matches!(self, OpCode::AllocLq)
    }

    /// Consumes the handle ids listed in `vqs`
    pub fn consumes_vqs(&self) -> bool {
        matches!(
            self,
            OpCode::FreeLq | OpCode::MeasureZ | OpCode::MeasureX | OpCode::MeasureBell
        )
    }

    /// Unitary gate in the reversible-segment sense
    pub fn is_unitary(&self) -> bool {
        matches!(
            self,
            OpCode::ApplyH
                | OpCode::ApplyS
                | OpCode::ApplyX
                | OpCode::ApplyY
                | OpCode::ApplyZ
                | OpCode::ApplyT
                | OpCode::ApplyRz
                | OpCode::ApplyCnot
                | OpCode::ApplyCz
                | OpCode::ApplySwap
        )
    }

    /// Terminates a reversible segment
    pub fn is_irreversible(&self) -> bool {
        matches!(
            self,
            OpCode::MeasureZ
                | OpCode::MeasureX
                | OpCode::MeasureBell
                | OpCode::Reset
                | OpCode::CloseChan
        )
    }

    /// Touches two qubits and is therefore firewall-checked
    pub fn is_two_qubit(&self) -> bool {
        matches!(
            self,
            OpCode::ApplyCnot
                | OpCode::ApplyCz
                | OpCode::ApplySwap
                | OpCode::MeasureBell
                | OpCode::TeleportCnot
        )
    }

    /// Reversible-segment checkpoint marker
    pub fn is_rev_marker(&self) -> bool {
        matches!(self, OpCode::BeginRev | OpCode::EndRev)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Guard predicate over classical measurement events
///
/// Grammar: `pred ::= true | false | ev == 0 | ev == 1 | pred AND pred`.
/// Guards are pure and side-effect-free; the verifier restricts them to events
/// produced by transitive dependencies of the guarded node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GuardExpr {
    True,
    False,
    Eq { event: String, value: u8 },
    And { children: Vec<GuardExpr> },
}

impl GuardExpr {
    /// Shape validation beyond what serde enforces: bit values and non-empty
    /// conjunctions
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            GuardExpr::True | GuardExpr::False => Ok(()),
            GuardExpr::Eq { event, value } => {
                if event.is_empty() {
                    return Err("guard eq with empty event id".to_string());
                }
                if *value > 1 {
                    return Err(format!("guard eq value {value} is not a bit"));
                }
                Ok(())
            }
            GuardExpr::And { children } => {
                if children.is_empty() {
                    return Err("guard and with no children".to_string());
                }
                children.iter().try_for_each(GuardExpr::validate)
            }
        }
    }

    /// Collect every event id the predicate references
    pub fn events(&self, out: &mut HashSet<String>) {
        match self {
            GuardExpr::True | GuardExpr::False => {}
            GuardExpr::Eq { event, .. } => {
                out.insert(event.clone());
            }
            GuardExpr::And { children } => children.iter().for_each(|c| c.events(out)),
        }
    }

    /// Evaluate against the event map; events not yet produced read as false
    pub fn eval(&self, events: &HashMap<String, u8>) -> bool {
        match self {
            GuardExpr::True => true,
            GuardExpr::False => false,
            GuardExpr::Eq { event, value } => events.get(event) == Some(value),
            GuardExpr::And { children } => children.iter().all(|c| c.eval(events)),
        }
    }

    /// Flatten the conjunction into required event literals
    ///
    /// Returns `None` when the predicate is unsatisfiable (contains `false` or
    /// contradicting literals on the same event).
    pub fn literals(&self) -> Option<HashMap<String, u8>> {
        let mut lits = HashMap::new();
        if self.collect_literals(&mut lits) {
            Some(lits)
        } else {
            None
        }
    }

    fn collect_literals(&self, lits: &mut HashMap<String, u8>) -> bool {
        match self {
            GuardExpr::True => true,
            GuardExpr::False => false,
            GuardExpr::Eq { event, value } => match lits.insert(event.clone(), *value) {
                Some(prior) if prior != *value => false,
                _ => true,
            },
            GuardExpr::And { children } => children.iter().all(|c| c.collect_literals(lits)),
        }
    }

    /// Decide whether two guards can never both hold
    ///
    /// Sound and complete for this grammar: conjunctions of literals are
    /// mutually exclusive exactly when one is unsatisfiable or some event is
    /// required to be 0 by one and 1 by the other.
    pub fn mutually_exclusive(a: &GuardExpr, b: &GuardExpr) -> bool {
        let (Some(la), Some(lb)) = (a.literals(), b.literals()) else {
            return true;
        };
        la.iter()
            .any(|(event, value)| lb.get(event).is_some_and(|other| other != value))
    }
}

/// One node of a QVM program graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Unique id within the graph
    pub id: String,
    /// Operation this node performs
    pub op: OpCode,
    /// Virtual-qubit handle ids consumed/produced, in positional order
    #[serde(default)]
    pub vqs: Vec<String>,
    /// Event ids introduced by this node (measurement opcodes only)
    #[serde(default)]
    pub produces: Vec<String>,
    /// Opcode-dependent scalar arguments
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Capability kinds the node declares it needs
    #[serde(default)]
    pub caps: Vec<Capability>,
    /// Node ids this node depends on (the DAG edges)
    #[serde(default)]
    pub deps: Vec<String>,
    /// Execution predicate; absent means always execute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<GuardExpr>,
}

impl GraphNode {
    /// Capability set declared on this node
    pub fn declared_caps(&self) -> CapabilitySet {
        CapabilitySet::from_caps(&self.caps)
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    pub fn arg_u64(&self, key: &str) -> Option<u64> {
        self.args.get(key).and_then(Value::as_u64)
    }

    pub fn arg_f64(&self, key: &str) -> Option<f64> {
        self.args.get(key).and_then(Value::as_f64)
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        self.args.get(key).and_then(Value::as_bool)
    }

    /// String-list argument, e.g. `OPEN_CHAN.args.peers`
    pub fn arg_str_list(&self, key: &str) -> Option<Vec<&str>> {
        self.args
            .get(key)?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    }
}

/// Parse discipline for unknown wire fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMode {
    /// Reject unknown fields anywhere in the document
    Strict,
    /// Ignore unknown fields
    Compatible,
}

const GRAPH_FIELDS: [&str; 3] = ["version", "nodes", "metadata"];
const NODE_FIELDS: [&str; 8] = ["id", "op", "vqs", "produces", "args", "caps", "deps", "guard"];
const GUARD_FIELDS: [&str; 4] = ["kind", "event", "value", "children"];

/// A QVM program graph: an ordered bag of nodes plus a format version
///
/// The node order is the producer's preferred order; only the `deps` relation
/// is semantically meaningful, and the verifier computes its own topological
/// extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramGraph {
    pub version: String,
    pub nodes: Vec<GraphNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ProgramGraph {
    pub fn new(version: impl Into<String>, nodes: Vec<GraphNode>) -> Self {
        Self {
            version: version.into(),
            nodes,
            metadata: None,
        }
    }

    /// Parse a graph from its wire form
    ///
    /// Unknown opcodes and malformed guards are reported as verification
    /// errors naming the offending node; anything else that fails to parse is
    /// a serialization error.
    ///
    /// # Errors
    ///
    /// Returns an error when the document is not valid JSON, when strict mode
    /// finds an unknown field, when a node carries an opcode outside the
    /// catalogue, or when a guard violates the grammar.
    pub fn from_json(input: &str, mode: ParseMode) -> Result<Self> {
        let value: Value = serde_json::from_str(input)
            .map_err(|e| QvmError::Serialization(format!("graph is not valid JSON: {e}")))?;
        Self::from_value(value, mode)
    }

    /// Parse a graph from an already-decoded JSON value
    pub fn from_value(value: Value, mode: ParseMode) -> Result<Self> {
        let top = value
            .as_object()
            .ok_or_else(|| QvmError::Serialization("graph document must be a map".to_string()))?;

        if mode == ParseMode::Strict {
            check_known_fields(top, &GRAPH_FIELDS, "graph")?;
        }

        let nodes = top
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| QvmError::Serialization("graph is missing a nodes list".to_string()))?;

        // Pre-scan node records so opcode and guard violations are reported
        // with the offending node id rather than as a bare serde failure.
        for raw in nodes {
            let node = raw.as_object().ok_or_else(|| {
                QvmError::Serialization("node record must be a map".to_string())
            })?;
            let node_id = node.get("id").and_then(Value::as_str).unwrap_or("<no id>");

            if mode == ParseMode::Strict {
                check_known_fields(node, &NODE_FIELDS, node_id)?;
                if let Some(guard) = node.get("guard").and_then(Value::as_object) {
                    check_guard_fields(guard, node_id)?;
                }
            }

            let op_name = node.get("op").and_then(Value::as_str).ok_or_else(|| {
                QvmError::Verification(
                    VerificationError::new(
                        VerificationRule::MalformedArgs,
                        "node is missing an opcode",
                    )
                    .at_node(node_id),
                )
            })?;
            if OpCode::parse(op_name).is_none() {
                return Err(QvmError::Verification(
                    VerificationError::new(
                        VerificationRule::UnknownOp,
                        format!("opcode '{op_name}' is not in the catalogue"),
                    )
                    .at_node(node_id),
                ));
            }
            if let Some(guard) = node.get("guard") {
                let parsed: GuardExpr = match serde_json::from_value(guard.clone()) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        return Err(QvmError::Verification(
                            VerificationError::new(
                                VerificationRule::MalformedArgs,
                                format!("guard does not match the grammar: {e}"),
                            )
                            .at_node(node_id),
                        ))
                    }
                };
                if let Err(reason) = parsed.validate() {
                    return Err(QvmError::Verification(
                        VerificationError::new(VerificationRule::MalformedArgs, reason)
                            .at_node(node_id),
                    ));
                }
            }
        }

        serde_json::from_value(strip_unknown(value, mode))
            .map_err(|e| QvmError::Serialization(format!("graph record rejected: {e}")))
    }

    /// Canonical UTF-8 encoding: struct field order, no insignificant whitespace
    pub fn to_canonical_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| QvmError::Serialization(format!("canonical encoding failed: {e}")))
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_canonical_json()?.into_bytes())
    }

    /// Domain-separated fingerprint of the canonical encoding
    pub fn fingerprint(&self) -> Result<[u8; 32]> {
        let mut hasher = Sha3_256::new();
        hasher.update(b"qvm-graph-v1");
        hasher.update(self.canonical_bytes()?);
        Ok(hasher.finalize().into())
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Union of capability kinds declared across all nodes
    pub fn declared_caps(&self) -> CapabilitySet {
        self.nodes
            .iter()
            .fold(CapabilitySet::empty(), |set, n| set | n.declared_caps())
    }
}

fn check_known_fields(map: &Map<String, Value>, allowed: &[&str], context: &str) -> Result<()> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(QvmError::Serialization(format!(
                "unknown field '{key}' in '{context}' (strict mode)"
            )));
        }
    }
    Ok(())
}

fn check_guard_fields(guard: &Map<String, Value>, node_id: &str) -> Result<()> {
    for key in guard.keys() {
        if !GUARD_FIELDS.contains(&key.as_str()) {
            return Err(QvmError::Serialization(format!(
                "unknown guard field '{key}' in node '{node_id}' (strict mode)"
            )));
        }
    }
    if let Some(children) = guard.get("children").and_then(Value::as_array) {
        for child in children {
            if let Some(child) = child.as_object() {
                check_guard_fields(child, node_id)?;
            }
        }
    }
    Ok(())
}

/// In compatibility mode, drop fields serde would otherwise choke on
fn strip_unknown(mut value: Value, mode: ParseMode) -> Value {
    if mode == ParseMode::Strict {
        return value;
    }
    if let Some(top) = value.as_object_mut() {
        top.retain(|k, _| GRAPH_FIELDS.contains(&k.as_str()));
        if let Some(nodes) = top.get_mut("nodes").and_then(Value::as_array_mut) {
            for raw in nodes {
                if let Some(node) = raw.as_object_mut() {
                    node.retain(|k, _| NODE_FIELDS.contains(&k.as_str()));
                }
            }
        }
    }
    value
}

/// Iterator over the full opcode catalogue
pub fn opcode_catalogue() -> impl Iterator<Item = OpCode> {
    OpCode::ALL.iter().copied()
}
