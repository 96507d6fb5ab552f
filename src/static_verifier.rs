//! # Static Verifier - Single-Pass Graph Certification
//!
//! Decides admissibility of a program graph before any execution. The
//! verifier is a free-function sequence of stages, rejecting early on the
//! first violation to bound worst-case admission time:
//!
//! 1. **Structural** — unique node ids, resolvable deps, well-typed args,
//!    opcode arity, event output counts, guard grammar
//! 2. **Topology** — Kahn ordering; `Cyclic` names a participating node
//! 3. **Linearity** — `Live | Consumed | Unseen` walk per virtual qubit and
//!    channel; branches under provably mutually-exclusive guards may each
//!    consume the same handle
//! 4. **Guards** — every referenced event must be produced by a transitive
//!    dependency of the guarded node
//! 5. **Capability coverage** — per-node required ⊆ declared ⊆ token grant;
//!    a node cannot under-declare
//! 6. **Firewall intent** — two-qubit operations over handles the graph never
//!    introduced are cross-tenant intent violations; channels must involve
//!    the submitting tenant
//! 7. **REV marking** — maximal unitary runs are annotated; rollback fences
//!    require checkpoint markers when the engine advertises rollback
//!
//! Success produces a [`Certificate`] binding the graph fingerprint to the
//! token id. The engine refuses to execute any graph whose certificate is
//! absent or whose fingerprint mismatches.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::capability_mediator::CapabilityToken;
use crate::graph_model::{GraphNode, GuardExpr, OpCode, ProgramGraph, VqShape};
use crate::logical_qubit::QecProfile;
use crate::{LinearityFault, QvmError, Result, VerificationError, VerificationRule};

/// One maximal run of unitary operations on a virtual qubit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevSegment {
    pub vq: String,
    pub start_node: String,
    pub end_node: String,
    /// Number of unitary operations in the run
    pub ops: usize,
}

/// Proof of admission consumed by the execution engine
///
/// Opaque to producers: carries the graph fingerprint, the id of the token
/// the graph was certified against, and the reversible-segment annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub graph_hash: [u8; 32],
    pub token_id: String,
    pub rev_segments: Vec<RevSegment>,
}

impl Certificate {
    /// Does this certificate attest exactly this graph?
    pub fn matches(&self, graph: &ProgramGraph) -> bool {
        graph
            .fingerprint()
            .map(|hash| hash == self.graph_hash)
            .unwrap_or(false)
    }
}

/// Verifier configuration for one certification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierOptions {
    /// Tenant of the submitting session; all in-graph allocations belong to it
    pub session_tenant: String,
    /// When set, rollback fences require checkpoint markers around their
    /// reversible segment
    pub advertise_rollback: bool,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            session_tenant: "default".to_string(),
            advertise_rollback: false,
        }
    }
}

fn reject(rule: VerificationRule, detail: impl Into<String>) -> VerificationError {
    VerificationError::new(rule, detail)
}

fn fail(err: VerificationError) -> QvmError {
    QvmError::Verification(err)
}

/// Certify a graph against a token
///
/// # Errors
///
/// Returns the first rule violation found, tagged with the offending node and
/// handle where attributable. A returned certificate attests that every
/// invariant of the graph model holds.
pub fn certify(
    graph: &ProgramGraph,
    token: &CapabilityToken,
    options: &VerifierOptions,
) -> Result<Certificate> {
    let index_of = stage_structural(graph)?;
    let analysis = stage_topology(graph, &index_of)?;
    let introduced = stage_linearity(graph, &analysis)?;
    stage_guards(graph, &analysis)?;
    stage_capabilities(graph, token)?;
    stage_firewall_intent(graph, &introduced, options)?;
    let rev_segments = stage_rev_marking(graph, &analysis, options)?;

    Ok(Certificate {
        graph_hash: graph.fingerprint()?,
        token_id: token.id.clone(),
        rev_segments,
    })
}

/// Topological order of node indices for a graph that already certified
///
/// The engine dispatches in exactly this order; it is deterministic for a
/// given graph.
pub fn topological_order(graph: &ProgramGraph) -> Result<Vec<usize>> {
    let index_of = stage_structural(graph)?;
    Ok(stage_topology(graph, &index_of)?.order)
}

// ---------------------------------------------------------------------------
// Stage 1: structural
// ---------------------------------------------------------------------------

fn stage_structural(graph: &ProgramGraph) -> Result<HashMap<String, usize>> {
    let mut index_of = HashMap::with_capacity(graph.nodes.len());
    for (idx, node) in graph.nodes.iter().enumerate() {
        if node.id.is_empty() {
            return Err(fail(reject(
                VerificationRule::MalformedArgs,
                "node with empty id",
            )));
        }
        if index_of.insert(node.id.clone(), idx).is_some() {
            return Err(fail(
                reject(VerificationRule::MalformedArgs, "duplicate node id")
                    .at_node(&node.id),
            ));
        }
    }

    let mut event_producers: HashMap<&str, &str> = HashMap::new();
    for node in &graph.nodes {
        for dep in &node.deps {
            if !index_of.contains_key(dep) {
                return Err(fail(
                    reject(
                        VerificationRule::MalformedArgs,
                        format!("dependency '{dep}' does not exist"),
                    )
                    .at_node(&node.id),
                ));
            }
        }

        check_vq_list(node)?;
        check_args(node)?;

        let expected_events = node.op.event_outputs();
        if node.produces.len() != expected_events {
            return Err(fail(
                reject(
                    VerificationRule::MalformedArgs,
                    format!(
                        "{} must produce {expected_events} events, lists {}",
                        node.op,
                        node.produces.len()
                    ),
                )
                .at_node(&node.id),
            ));
        }
        for ev in &node.produces {
            if let Some(prior) = event_producers.insert(ev.as_str(), node.id.as_str()) {
                return Err(fail(
                    reject(
                        VerificationRule::MalformedArgs,
                        format!("event '{ev}' already produced by node '{prior}'"),
                    )
                    .at_node(&node.id),
                ));
            }
        }

        if let Some(guard) = &node.guard {
            if let Err(reason) = guard.validate() {
                return Err(fail(
                    reject(VerificationRule::MalformedArgs, reason).at_node(&node.id),
                ));
            }
        }
    }
    Ok(index_of)
}

fn check_vq_list(node: &GraphNode) -> Result<()> {
    let ok = match node.op.vq_shape() {
        VqShape::Exact(n) => node.vqs.len() == n,
        VqShape::AtLeast(n) => node.vqs.len() >= n,
    };
    if !ok {
        return Err(fail(
            reject(
                VerificationRule::MalformedArgs,
                format!("{} lists {} handles", node.op, node.vqs.len()),
            )
            .at_node(&node.id),
        ));
    }
    let mut seen = HashSet::new();
    for vq in &node.vqs {
        if !seen.insert(vq) {
            return Err(fail(
                reject(
                    VerificationRule::MalformedArgs,
                    format!("handle '{vq}' repeated in one operation"),
                )
                .at_node(&node.id)
                .on_handle(vq),
            ));
        }
    }
    Ok(())
}

fn check_args(node: &GraphNode) -> Result<()> {
    let malformed = |detail: String| {
        fail(reject(VerificationRule::MalformedArgs, detail).at_node(&node.id))
    };
    match node.op {
        OpCode::AllocLq => {
            let n = node
                .arg_u64("n")
                .ok_or_else(|| malformed("ALLOC_LQ requires integer args.n".to_string()))?;
            if n == 0 {
                return Err(malformed("ALLOC_LQ with n = 0".to_string()));
            }
            if n as usize != node.vqs.len() {
                return Err(malformed(format!(
                    "ALLOC_LQ n = {n} but {} output handles listed",
                    node.vqs.len()
                )));
            }
            if let Some(profile) = node.arg("profile") {
                serde_json::from_value::<QecProfile>(profile.clone())
                    .map_err(|e| malformed(format!("invalid QEC profile: {e}")))?;
            }
        }
        OpCode::ApplyRz => {
            let theta = node
                .arg_f64("theta")
                .ok_or_else(|| malformed("APPLY_RZ requires numeric args.theta".to_string()))?;
            if !theta.is_finite() {
                return Err(malformed("APPLY_RZ theta must be finite".to_string()));
            }
        }
        OpCode::OpenChan => {
            let chan = node
                .arg_str("chan")
                .ok_or_else(|| malformed("OPEN_CHAN requires string args.chan".to_string()))?;
            if chan.is_empty() {
                return Err(malformed("OPEN_CHAN with empty channel id".to_string()));
            }
            let peers = node
                .arg_str_list("peers")
                .ok_or_else(|| malformed("OPEN_CHAN requires args.peers".to_string()))?;
            if peers.len() != 2 || peers[0] == peers[1] {
                return Err(malformed(
                    "OPEN_CHAN peers must name two distinct tenants".to_string(),
                ));
            }
        }
        OpCode::CloseChan => {
            node.arg_str("chan")
                .ok_or_else(|| malformed("CLOSE_CHAN requires string args.chan".to_string()))?;
        }
        OpCode::TeleportCnot => {
            // Channel naming is optional for intra-tenant teleports; when
            // present it must at least be a string.
            if node.arg("chan").is_some() && node.arg_str("chan").is_none() {
                return Err(malformed("TELEPORT_CNOT args.chan must be a string".to_string()));
            }
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage 2: topology
// ---------------------------------------------------------------------------

struct Analysis {
    /// Topological order of node indices
    order: Vec<usize>,
    /// Ancestor bitsets: `ancestors[i]` covers every transitive dependency of
    /// node `i`
    ancestors: Vec<Vec<u64>>,
    /// Position of each node in `order`
    topo_pos: Vec<usize>,
}

impl Analysis {
    fn reaches(&self, from: usize, to: usize) -> bool {
        self.ancestors[to][from / 64] & (1u64 << (from % 64)) != 0
    }
}

fn stage_topology(graph: &ProgramGraph, index_of: &HashMap<String, usize>) -> Result<Analysis> {
    let n = graph.nodes.len();
    let mut in_degree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut dep_sets: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (idx, node) in graph.nodes.iter().enumerate() {
        let mut deps: Vec<usize> = node.deps.iter().map(|d| index_of[d]).collect();
        deps.sort_unstable();
        deps.dedup();
        in_degree[idx] = deps.len();
        for &dep in &deps {
            successors[dep].push(idx);
        }
        dep_sets[idx] = deps;
    }

    // Kahn with an index-ordered ready queue, so the dispatch order is
    // deterministic for a given graph.
    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = ready.pop_front() {
        order.push(node);
        for &next in &successors[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n)
            .find(|&i| in_degree[i] > 0)
            .expect("incomplete order implies a remaining in-degree");
        return Err(fail(
            reject(
                VerificationRule::Cyclic,
                "dependency relation admits no topological extension",
            )
            .at_node(&graph.nodes[stuck].id),
        ));
    }

    let words = n.div_ceil(64).max(1);
    let mut ancestors = vec![vec![0u64; words]; n];
    for &idx in &order {
        let mut bits = vec![0u64; words];
        for &dep in &dep_sets[idx] {
            for (word, anc_word) in bits.iter_mut().zip(&ancestors[dep]) {
                *word |= anc_word;
            }
            bits[dep / 64] |= 1u64 << (dep % 64);
        }
        ancestors[idx] = bits;
    }

    let mut topo_pos = vec![0usize; n];
    for (pos, &idx) in order.iter().enumerate() {
        topo_pos[idx] = pos;
    }

    Ok(Analysis {
        order,
        ancestors,
        topo_pos,
    })
}

// ---------------------------------------------------------------------------
// Stage 3: linearity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UseKind {
    /// Gate, reset, teleport, or injection: the handle stays live
    Touch,
    /// Measurement: destroys the quantum state; only a free may follow
    Measure,
    /// Free or close: the handle is gone
    Free,
}

struct HandleUse {
    node_idx: usize,
    kind: UseKind,
}

/// Virtual qubit ids the graph introduces through `ALLOC_LQ`
struct IntroducedHandles {
    vqs: HashSet<String>,
}

fn guards_exclusive(a: Option<&GuardExpr>, b: Option<&GuardExpr>) -> bool {
    match (a, b) {
        (Some(ga), Some(gb)) => GuardExpr::mutually_exclusive(ga, gb),
        // An unguarded node always runs; no exclusivity to prove
        _ => false,
    }
}

fn stage_linearity(graph: &ProgramGraph, analysis: &Analysis) -> Result<IntroducedHandles> {
    let mut vq_producer: HashMap<&str, usize> = HashMap::new();
    let mut chan_producer: HashMap<&str, usize> = HashMap::new();
    let mut vq_uses: HashMap<&str, Vec<HandleUse>> = HashMap::new();
    let mut chan_uses: HashMap<&str, Vec<HandleUse>> = HashMap::new();

    // First sweep in topological order: producers, then per-handle use lists
    for &idx in &analysis.order {
        let node = &graph.nodes[idx];
        match node.op {
            OpCode::AllocLq => {
                for vq in &node.vqs {
                    if vq_producer.insert(vq.as_str(), idx).is_some() {
                        return Err(fail(
                            reject(
                                VerificationRule::Linearity(LinearityFault::ReDefinition),
                                "handle already has a producer",
                            )
                            .at_node(&node.id)
                            .on_handle(vq),
                        ));
                    }
                }
            }
            OpCode::OpenChan => {
                let chan = node.arg_str("chan").expect("checked structurally");
                if chan_producer.insert(chan, idx).is_some() {
                    return Err(fail(
                        reject(
                            VerificationRule::Linearity(LinearityFault::ReDefinition),
                            "channel already has a producer",
                        )
                        .at_node(&node.id)
                        .on_handle(chan),
                    ));
                }
            }
            _ => {}
        }

        if !node.op.introduces_vqs() {
            let kind = match node.op {
                OpCode::MeasureZ | OpCode::MeasureX | OpCode::MeasureBell => UseKind::Measure,
                OpCode::FreeLq => UseKind::Free,
                _ => UseKind::Touch,
            };
            for vq in &node.vqs {
                vq_uses
                    .entry(vq.as_str())
                    .or_default()
                    .push(HandleUse { node_idx: idx, kind });
            }
        }

        match node.op {
            OpCode::CloseChan => {
                let chan = node.arg_str("chan").expect("checked structurally");
                chan_uses
                    .entry(chan)
                    .or_default()
                    .push(HandleUse { node_idx: idx, kind: UseKind::Free });
            }
            op if op.is_two_qubit() && op != OpCode::OpenChan => {
                if let Some(chan) = node.arg_str("chan") {
                    chan_uses
                        .entry(chan)
                        .or_default()
                        .push(HandleUse { node_idx: idx, kind: UseKind::Touch });
                }
            }
            _ => {}
        }
    }

    // Second sweep: per-handle path discipline
    for (vq, uses) in &vq_uses {
        match vq_producer.get(*vq) {
            Some(&producer) => {
                for handle_use in uses {
                    if !analysis.reaches(producer, handle_use.node_idx) {
                        let node = &graph.nodes[handle_use.node_idx];
                        return Err(fail(
                            reject(
                                VerificationRule::Linearity(LinearityFault::Dangling),
                                "use is not ordered after the producing allocation",
                            )
                            .at_node(&node.id)
                            .on_handle(*vq),
                        ));
                    }
                }
                check_handle_path(graph, analysis, vq, uses, HandleClass::VirtualQubit)?;
            }
            None => {
                // Never introduced by this graph. Single-qubit traffic on a
                // foreign id is a dangling reference; two-qubit traffic is
                // cross-tenant intent and is judged by stage 6.
                for handle_use in uses {
                    let node = &graph.nodes[handle_use.node_idx];
                    if !node.op.is_two_qubit() {
                        return Err(fail(
                            reject(
                                VerificationRule::Linearity(LinearityFault::Dangling),
                                "handle was never introduced by this graph",
                            )
                            .at_node(&node.id)
                            .on_handle(*vq),
                        ));
                    }
                }
            }
        }
    }

    for (chan, uses) in &chan_uses {
        match chan_producer.get(*chan) {
            Some(&producer) => {
                for handle_use in uses {
                    if !analysis.reaches(producer, handle_use.node_idx) {
                        let node = &graph.nodes[handle_use.node_idx];
                        return Err(fail(
                            reject(
                                VerificationRule::Linearity(LinearityFault::Dangling),
                                "channel use is not ordered after OPEN_CHAN",
                            )
                            .at_node(&node.id)
                            .on_handle(*chan),
                        ));
                    }
                }
                check_handle_path(graph, analysis, chan, uses, HandleClass::Channel)?;
            }
            None => {
                let node = &graph.nodes[uses[0].node_idx];
                return Err(fail(
                    reject(
                        VerificationRule::Linearity(LinearityFault::Dangling),
                        "channel was never opened by this graph",
                    )
                    .at_node(&node.id)
                    .on_handle(*chan),
                ));
            }
        }
    }

    // Leak detection: an introduced virtual qubit needs at least one consumer
    // (a measurement or a free) somewhere in the graph. Channels may stay
    // open; the engine closes them at UNLOAD and session end.
    for (vq, &producer) in &vq_producer {
        let consumed = vq_uses
            .get(vq)
            .map(|uses| uses.iter().any(|u| u.kind != UseKind::Touch))
            .unwrap_or(false);
        if !consumed {
            return Err(fail(
                reject(
                    VerificationRule::Linearity(LinearityFault::Leak),
                    "qubit is still live at graph end with no consumer",
                )
                .at_node(&graph.nodes[producer].id)
                .on_handle(*vq),
            ));
        }
    }

    Ok(IntroducedHandles {
        vqs: vq_producer.keys().map(|s| s.to_string()).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleClass {
    VirtualQubit,
    Channel,
}

/// Enforce the path discipline over one handle's uses
///
/// Uses arrive in topological order. Any two uses that are not governed by
/// mutually exclusive guards must be dependency-ordered, and nothing may
/// follow a free; only a free may follow a measurement.
fn check_handle_path(
    graph: &ProgramGraph,
    analysis: &Analysis,
    handle: &str,
    uses: &[HandleUse],
    class: HandleClass,
) -> Result<()> {
    let mut ordered: Vec<&HandleUse> = uses.iter().collect();
    ordered.sort_by_key(|u| analysis.topo_pos[u.node_idx]);

    for (i, current) in ordered.iter().enumerate() {
        let current_node = &graph.nodes[current.node_idx];
        for prior in &ordered[..i] {
            let prior_node = &graph.nodes[prior.node_idx];
            if guards_exclusive(prior_node.guard.as_ref(), current_node.guard.as_ref()) {
                continue;
            }

            match (prior.kind, current.kind, class) {
                (UseKind::Free, UseKind::Free, HandleClass::Channel) => {
                    return Err(fail(
                        reject(
                            VerificationRule::Linearity(LinearityFault::DoubleConsume),
                            "channel closed twice on one path",
                        )
                        .at_node(&current_node.id)
                        .on_handle(handle),
                    ));
                }
                (UseKind::Free, _, _) => {
                    return Err(fail(
                        reject(
                            VerificationRule::Linearity(LinearityFault::UseAfterFree),
                            "handle used after it was consumed",
                        )
                        .at_node(&current_node.id)
                        .on_handle(handle),
                    ));
                }
                (UseKind::Measure, kind, _) if kind != UseKind::Free => {
                    return Err(fail(
                        reject(
                            VerificationRule::Linearity(LinearityFault::UseAfterFree),
                            "qubit state was destroyed by measurement",
                        )
                        .at_node(&current_node.id)
                        .on_handle(handle),
                    ));
                }
                _ => {}
            }

            // Non-exclusive uses must form a path, not a fork
            if !analysis.reaches(prior.node_idx, current.node_idx) {
                return Err(fail(
                    reject(
                        VerificationRule::Linearity(LinearityFault::DoubleConsume),
                        "unordered concurrent uses of one linear handle",
                    )
                    .at_node(&current_node.id)
                    .on_handle(handle),
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage 4: guard scope
// ---------------------------------------------------------------------------

fn stage_guards(graph: &ProgramGraph, analysis: &Analysis) -> Result<()> {
    let mut event_producer: HashMap<&str, usize> = HashMap::new();
    for (idx, node) in graph.nodes.iter().enumerate() {
        for ev in &node.produces {
            event_producer.insert(ev.as_str(), idx);
        }
    }

    for (idx, node) in graph.nodes.iter().enumerate() {
        let Some(guard) = &node.guard else { continue };
        let mut events = HashSet::new();
        guard.events(&mut events);
        for ev in events {
            let Some(&producer) = event_producer.get(ev.as_str()) else {
                return Err(fail(
                    reject(
                        VerificationRule::GuardOutOfScope,
                        format!("event '{ev}' is never produced"),
                    )
                    .at_node(&node.id),
                ));
            };
            if !analysis.reaches(producer, idx) {
                return Err(fail(
                    reject(
                        VerificationRule::GuardOutOfScope,
                        format!("event '{ev}' is not produced by a dependency"),
                    )
                    .at_node(&node.id),
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage 5: capability coverage
// ---------------------------------------------------------------------------

fn stage_capabilities(graph: &ProgramGraph, token: &CapabilityToken) -> Result<()> {
    for node in &graph.nodes {
        let required = node.op.required_caps();
        let declared = node.declared_caps();

        // Defense in depth: a node cannot under-declare its own needs
        if !declared.contains(required) {
            return Err(fail(
                reject(
                    VerificationRule::CapabilityCoverage,
                    format!(
                        "node declares {declared} but {} requires {required}",
                        node.op
                    ),
                )
                .at_node(&node.id),
            ));
        }
        if !token.caps.contains(declared) {
            return Err(fail(
                reject(
                    VerificationRule::CapabilityCoverage,
                    format!("token grants {}, node needs {declared}", token.caps),
                )
                .at_node(&node.id),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage 6: firewall intent
// ---------------------------------------------------------------------------

fn stage_firewall_intent(
    graph: &ProgramGraph,
    introduced: &IntroducedHandles,
    options: &VerifierOptions,
) -> Result<()> {
    for node in &graph.nodes {
        if node.op == OpCode::OpenChan {
            let peers = node.arg_str_list("peers").expect("checked structurally");
            if !peers.contains(&options.session_tenant.as_str()) {
                return Err(fail(
                    reject(
                        VerificationRule::FirewallIntent,
                        format!(
                            "channel peers {peers:?} do not include tenant '{}'",
                            options.session_tenant
                        ),
                    )
                    .at_node(&node.id),
                ));
            }
            continue;
        }

        if !node.op.is_two_qubit() {
            continue;
        }
        for vq in &node.vqs {
            // In-graph allocations all belong to the session tenant; a handle
            // this graph never introduced is someone else's qubit.
            if !introduced.vqs.contains(vq) {
                return Err(fail(
                    reject(
                        VerificationRule::FirewallIntent,
                        "two-qubit operation over a handle this session does not own",
                    )
                    .at_node(&node.id)
                    .on_handle(vq),
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage 7: REV marking
// ---------------------------------------------------------------------------

fn stage_rev_marking(
    graph: &ProgramGraph,
    analysis: &Analysis,
    options: &VerifierOptions,
) -> Result<Vec<RevSegment>> {
    // Group unitary touches per qubit in topological order
    let mut per_vq: HashMap<&str, Vec<usize>> = HashMap::new();
    for &idx in &analysis.order {
        let node = &graph.nodes[idx];
        if node.op.introduces_vqs() {
            continue;
        }
        for vq in &node.vqs {
            per_vq.entry(vq.as_str()).or_default().push(idx);
        }
    }

    let mut segments = Vec::new();
    for (vq, touches) in &per_vq {
        let mut run: Vec<usize> = Vec::new();
        for &idx in touches {
            let op = graph.nodes[idx].op;
            if op.is_unitary() {
                run.push(idx);
            } else if op.is_irreversible() || op.consumes_vqs() {
                flush_run(graph, vq, &mut run, &mut segments);
            }
        }
        flush_run(graph, vq, &mut run, &mut segments);
    }
    segments.sort_by(|a, b| (&a.vq, &a.start_node).cmp(&(&b.vq, &b.start_node)));

    if options.advertise_rollback {
        let begin_markers: Vec<usize> = graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.op == OpCode::BeginRev)
            .map(|(i, _)| i)
            .collect();
        let end_markers: Vec<usize> = graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.op == OpCode::EndRev)
            .map(|(i, _)| i)
            .collect();

        for (idx, node) in graph.nodes.iter().enumerate() {
            if node.arg_bool("rollback_fence") != Some(true) {
                continue;
            }
            let fenced = begin_markers.iter().any(|&b| analysis.reaches(b, idx))
                && end_markers.iter().any(|&e| analysis.reaches(idx, e));
            if !fenced {
                return Err(fail(
                    reject(
                        VerificationRule::MalformedArgs,
                        "rollback fence requested without surrounding checkpoint markers",
                    )
                    .at_node(&node.id),
                ));
            }
        }
    }

    Ok(segments)
}

fn flush_run(
    graph: &ProgramGraph,
    vq: &str,
    run: &mut Vec<usize>,
    segments: &mut Vec<RevSegment>,
) {
    if run.is_empty() {
        return;
    }
    segments.push(RevSegment {
        vq: vq.to_string(),
        start_node: graph.nodes[run[0]].id.clone(),
        end_node: graph.nodes[*run.last().expect("non-empty run")].id.clone(),
        ops: run.len(),
    });
    run.clear();
}
