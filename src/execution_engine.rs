//! # Execution Engine - Topological Interpreter of Certified Graphs
//!
//! Executes one certified program graph per call: LOAD binds the certificate
//! to the graph and builds a fresh execution context; EXECUTE walks nodes in
//! topological order, evaluating guards, charging the capability mediator for
//! every operation, and dispatching by opcode to the resource manager,
//! entanglement firewall, and logical qubit model; UNLOAD always runs through
//! the context's scope guard, freeing every still-live qubit and channel on
//! every exit path without ever propagating an error.
//!
//! ## 🏗️ State Machine
//!
//! `Loaded → Running → (Completed | Failed | Cancelled)` — every transition is
//! written to the audit log. A failure during EXECUTE halts further dispatch,
//! captures the offending node id and reason, and still unloads.
//!
//! ## Scheduling
//!
//! A single engine executes one graph at a time, single-threadedly and
//! cooperatively: the cancellation flag and the wall-clock deadline are
//! checked between nodes, never inside one. Multiple engines run concurrently
//! on distinct threads, sharing only the mediator, resource manager, firewall,
//! and audit log behind their own synchronization.
//!
//! ## Determinism
//!
//! The context PRNG is a ChaCha20 stream seeded from the session job seed;
//! with a fixed seed, repeated runs produce identical event maps and identical
//! audit-leaf sequences modulo timestamps.

use metrics::counter;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audit_log::{AuditEventKind, AuditLog};
use crate::capability_mediator::{CapabilityToken, TokenMediator};
use crate::entanglement_firewall::EntanglementFirewall;
use crate::graph_model::{GraphNode, OpCode, ProgramGraph};
use crate::logging::{log_error, log_execution, LogCategory};
use crate::logical_qubit::{MeasurementBasis, QecProfile};
use crate::qvm_service::SessionContext;
use crate::resource_manager::ResourceManager;
use crate::static_verifier::{topological_order, Certificate};
use crate::{QvmError, Result};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Loaded,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Loaded => "loaded",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Shared per-job progress counters, readable while the job runs
#[derive(Debug)]
pub struct JobProgress {
    pub total_nodes: usize,
    dispatched: AtomicUsize,
    events: AtomicUsize,
    current_node: parking_lot::Mutex<Option<String>>,
}

impl JobProgress {
    pub fn new(total_nodes: usize) -> Self {
        Self {
            total_nodes,
            dispatched: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
            current_node: parking_lot::Mutex::new(None),
        }
    }

    fn record(&self, node_id: &str, new_events: usize) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(new_events, Ordering::Relaxed);
        *self.current_node.lock() = Some(node_id.to_string());
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn events_so_far(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }

    pub fn fraction(&self) -> f64 {
        if self.total_nodes == 0 {
            return 1.0;
        }
        self.dispatched() as f64 / self.total_nodes as f64
    }

    pub fn current_node(&self) -> Option<String> {
        self.current_node.lock().clone()
    }
}

/// Cooperative controls the service hands to a running job
pub struct JobControls {
    /// Set to request cancellation; checked between node dispatches
    pub cancel: Arc<AtomicBool>,
    /// Wall-clock deadline; checked between node dispatches
    pub deadline: Option<Instant>,
    pub progress: Arc<JobProgress>,
}

/// Final result of one engine execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub state: JobState,
    /// Classical event map produced along the accepted path
    pub events: BTreeMap<String, u8>,
    pub ops_executed: u64,
    /// Node the job failed or was cancelled at, when applicable
    pub halted_at: Option<String>,
    pub error: Option<QvmError>,
}

/// Runtime binding of a graph-local virtual qubit id
enum VqBinding {
    /// Bound to a live kernel-issued qubit id
    Live(String),
    /// State destroyed by measurement; only FREE_LQ may still name it
    Destroyed,
}

/// Per-job execution context; its drop guard is the UNLOAD phase
///
/// Dropping the context frees every tracked qubit and closes every channel
/// the job opened, on every exit path including panics. Cleanup never
/// propagates errors; it only logs them.
struct ExecutionContext {
    job_id: String,
    tenant: String,
    resources: Arc<ResourceManager>,
    firewall: Arc<EntanglementFirewall>,
    audit: Arc<AuditLog>,
    bindings: HashMap<String, VqBinding>,
    channel_bindings: HashMap<String, String>,
    events: BTreeMap<String, u8>,
    /// Kernel ids of allocated-but-not-yet-freed qubits
    tracked: Vec<String>,
    rng: ChaCha20Rng,
    unloaded: bool,
}

impl ExecutionContext {
    fn new(
        job_id: &str,
        session: &SessionContext,
        resources: Arc<ResourceManager>,
        firewall: Arc<EntanglementFirewall>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            tenant: session.tenant.clone(),
            resources,
            firewall,
            audit,
            bindings: HashMap::new(),
            channel_bindings: HashMap::new(),
            events: BTreeMap::new(),
            tracked: Vec::new(),
            rng: ChaCha20Rng::from_seed(derive_job_seed(session.job_seed)),
            unloaded: false,
        }
    }

    /// Resolve a graph-local qubit id to its live kernel id
    fn live(&self, vq: &str) -> Result<String> {
        match self.bindings.get(vq) {
            Some(VqBinding::Live(kernel_id)) => Ok(kernel_id.clone()),
            Some(VqBinding::Destroyed) => Err(QvmError::InvalidHandle(format!(
                "qubit '{vq}' was destroyed by measurement"
            ))),
            None => Err(QvmError::InvalidHandle(format!("qubit '{vq}' is not bound"))),
        }
    }

    fn untrack(&mut self, kernel_id: &str) {
        self.tracked.retain(|id| id != kernel_id);
    }

    /// UNLOAD: free every still-live qubit and close the job's channels
    ///
    /// Runs on every exit path and never propagates errors.
    fn unload(&mut self) {
        if self.unloaded {
            return;
        }
        self.unloaded = true;

        let mut freed = 0usize;
        for kernel_id in std::mem::take(&mut self.tracked) {
            self.firewall.drop_vq(&kernel_id);
            match self.resources.free(std::slice::from_ref(&kernel_id)) {
                Ok(()) => freed += 1,
                Err(err) => {
                    self.audit.append(
                        AuditEventKind::CleanupError,
                        &self.tenant,
                        vec![kernel_id.clone()],
                        json!({"job": self.job_id, "error": err.to_string()}),
                    );
                    log_error(
                        LogCategory::Execution,
                        &format!("cleanup failed for '{kernel_id}': {err}"),
                    );
                }
            }
        }
        let channels_closed = self.firewall.close_channels_for_job(&self.job_id);

        self.audit.append(
            AuditEventKind::UnloadCompleted,
            &self.tenant,
            vec![self.job_id.clone()],
            json!({"qubits_freed": freed, "channels_closed": channels_closed}),
        );
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.unload();
    }
}

fn derive_job_seed(job_seed: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"qvm-job-seed-v1");
    hasher.update(job_seed.to_le_bytes());
    hasher.finalize().into()
}

/// The execution engine: owns nothing, shares everything by handle
///
/// One engine value executes one graph at a time; the service runs one engine
/// call per job thread. All cross-job state lives behind the shared
/// components' own locks.
pub struct ExecutionEngine {
    mediator: Arc<TokenMediator>,
    resources: Arc<ResourceManager>,
    firewall: Arc<EntanglementFirewall>,
    audit: Arc<AuditLog>,
}

impl ExecutionEngine {
    pub fn new(
        mediator: Arc<TokenMediator>,
        resources: Arc<ResourceManager>,
        firewall: Arc<EntanglementFirewall>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            mediator,
            resources,
            firewall,
            audit,
        }
    }

    /// Execute a certified graph to completion, failure, or cancellation
    ///
    /// The certificate must attest exactly this graph and this token; the
    /// engine refuses otherwise without touching any state.
    pub fn execute(
        &self,
        job_id: &str,
        graph: &ProgramGraph,
        certificate: &Certificate,
        token: &CapabilityToken,
        session: &SessionContext,
        controls: &JobControls,
    ) -> ExecutionOutcome {
        // LOAD: rebind the certificate to this graph
        if !certificate.matches(graph) || certificate.token_id != token.id {
            let err = QvmError::AuthFailed(
                "certificate does not attest this graph and token".to_string(),
            );
            self.log_transition(job_id, session, JobState::Loaded, JobState::Failed, None);
            return ExecutionOutcome {
                state: JobState::Failed,
                events: BTreeMap::new(),
                ops_executed: 0,
                halted_at: None,
                error: Some(err),
            };
        }

        let mut ctx = ExecutionContext::new(
            job_id,
            session,
            self.resources.clone(),
            self.firewall.clone(),
            self.audit.clone(),
        );
        self.log_transition(job_id, session, JobState::Loaded, JobState::Running, None);

        let order = match topological_order(graph) {
            Ok(order) => order,
            Err(err) => {
                // Cannot happen for a certified graph; treat as internal
                let internal = QvmError::Internal(format!("order recomputation failed: {err}"));
                ctx.unload();
                self.log_transition(job_id, session, JobState::Running, JobState::Failed, None);
                return ExecutionOutcome {
                    state: JobState::Failed,
                    events: ctx.events.clone(),
                    ops_executed: 0,
                    halted_at: None,
                    error: Some(internal),
                };
            }
        };

        let mut ops_executed = 0u64;
        let mut halted_at = None;
        let mut failure = None;
        let mut final_state = JobState::Completed;

        for idx in order {
            let node = &graph.nodes[idx];

            if controls.cancel.load(Ordering::Relaxed) {
                final_state = JobState::Cancelled;
                halted_at = Some(node.id.clone());
                failure = Some(QvmError::Cancelled);
                break;
            }
            if let Some(deadline) = controls.deadline {
                if Instant::now() >= deadline {
                    final_state = JobState::Cancelled;
                    halted_at = Some(node.id.clone());
                    failure = Some(QvmError::Timeout("job wall-clock deadline".to_string()));
                    break;
                }
            }

            // Guard short-circuit: a false guard skips the node in zero
            // operations; its produced qubits and events never become live.
            if let Some(guard) = &node.guard {
                let event_view: HashMap<String, u8> = ctx
                    .events
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                if !guard.eval(&event_view) {
                    continue;
                }
            }

            if let Err(err) = self.mediator.check(token, node.op) {
                final_state = JobState::Failed;
                halted_at = Some(node.id.clone());
                failure = Some(err);
                break;
            }

            match self.dispatch(node, session, &mut ctx) {
                Ok(new_events) => {
                    ops_executed += 1;
                    counter!("substrate_ops_dispatched_total", 1, "op" => node.op.as_str());
                    controls.progress.record(&node.id, new_events);
                    self.audit.append(
                        AuditEventKind::OperationExecuted,
                        &session.tenant,
                        vec![node.id.clone()],
                        json!({"job": job_id, "op": node.op.as_str()}),
                    );
                }
                Err(err) => {
                    final_state = JobState::Failed;
                    halted_at = Some(node.id.clone());
                    failure = Some(err);
                    break;
                }
            }
        }

        // UNLOAD runs here on the success and failure paths alike; the drop
        // guard covers unwinding.
        ctx.unload();
        self.log_transition(
            job_id,
            session,
            JobState::Running,
            final_state,
            halted_at.as_deref(),
        );
        log_execution(
            job_id,
            &format!("job reached state {final_state}"),
            json!({"ops_executed": ops_executed}),
        );

        ExecutionOutcome {
            state: final_state,
            events: ctx.events.clone(),
            ops_executed,
            halted_at,
            error: failure,
        }
    }

    fn log_transition(
        &self,
        job_id: &str,
        session: &SessionContext,
        from: JobState,
        to: JobState,
        node: Option<&str>,
    ) {
        self.audit.append(
            AuditEventKind::JobStateChanged,
            &session.tenant,
            vec![job_id.to_string()],
            json!({"from": from, "to": to, "node": node}),
        );
    }

    /// Dispatch one node; returns how many events it produced
    fn dispatch(
        &self,
        node: &GraphNode,
        session: &SessionContext,
        ctx: &mut ExecutionContext,
    ) -> Result<usize> {
        match node.op {
            OpCode::AllocLq => {
                let n = node.vqs.len();
                let live = self.resources.live_vqs(&session.tenant);
                if live + n > session.quota.max_live_vqs {
                    return Err(QvmError::QuotaExceeded(format!(
                        "allocation of {n} qubits would exceed the session cap of {}",
                        session.quota.max_live_vqs
                    )));
                }
                let profile = match node.arg("profile") {
                    Some(value) => serde_json::from_value::<QecProfile>(value.clone())
                        .map_err(|e| QvmError::Internal(format!("profile re-parse failed: {e}")))?,
                    None => QecProfile::default(),
                };
                let kernel_ids = self.resources.alloc(&session.tenant, n, &profile)?;
                for (graph_id, kernel_id) in node.vqs.iter().zip(&kernel_ids) {
                    ctx.bindings
                        .insert(graph_id.clone(), VqBinding::Live(kernel_id.clone()));
                    ctx.tracked.push(kernel_id.clone());
                }
                Ok(0)
            }

            OpCode::FreeLq => {
                for vq in &node.vqs {
                    match ctx.bindings.get(vq) {
                        Some(VqBinding::Live(kernel_id)) => {
                            let kernel_id = kernel_id.clone();
                            self.firewall.drop_vq(&kernel_id);
                            self.resources.free(std::slice::from_ref(&kernel_id))?;
                            ctx.untrack(&kernel_id);
                            ctx.bindings.insert(vq.clone(), VqBinding::Destroyed);
                        }
                        // Already destroyed by a measurement; freeing the
                        // handle is a no-op
                        Some(VqBinding::Destroyed) => {}
                        None => {
                            return Err(QvmError::InvalidHandle(format!(
                                "qubit '{vq}' is not bound"
                            )))
                        }
                    }
                }
                Ok(0)
            }

            OpCode::Reset => {
                let kernel_id = ctx.live(&node.vqs[0])?;
                self.firewall.drop_vq(&kernel_id);
                self.resources.with_qubit(&kernel_id, |q| q.reset())?;
                self.inject_errors(ctx, &[kernel_id])?;
                Ok(0)
            }

            OpCode::ApplyH
            | OpCode::ApplyS
            | OpCode::ApplyX
            | OpCode::ApplyY
            | OpCode::ApplyZ
            | OpCode::ApplyT => {
                let kernel_id = ctx.live(&node.vqs[0])?;
                self.resources.with_qubit(&kernel_id, |q| match node.op {
                    OpCode::ApplyH => q.apply_h(),
                    OpCode::ApplyS => q.apply_s(),
                    OpCode::ApplyX => q.apply_x(),
                    OpCode::ApplyY => q.apply_y(),
                    OpCode::ApplyZ => q.apply_z(),
                    _ => q.apply_t(),
                })?;
                self.inject_errors(ctx, &[kernel_id])?;
                Ok(0)
            }

            OpCode::ApplyRz => {
                let theta = node
                    .arg_f64("theta")
                    .ok_or_else(|| QvmError::Internal("theta vanished after admission".into()))?;
                let kernel_id = ctx.live(&node.vqs[0])?;
                self.resources
                    .with_qubit(&kernel_id, |q| q.apply_rz(theta))?;
                self.inject_errors(ctx, &[kernel_id])?;
                Ok(0)
            }

            OpCode::ApplyCnot | OpCode::ApplyCz | OpCode::ApplySwap | OpCode::TeleportCnot => {
                let a = ctx.live(&node.vqs[0])?;
                let b = ctx.live(&node.vqs[1])?;
                let chan = node
                    .arg_str("chan")
                    .and_then(|c| ctx.channel_bindings.get(c).cloned());
                self.firewall
                    .authorize_interaction(&a, &b, chan.as_deref(), &ctx.job_id)?;
                self.resources.with_pair(&a, &b, |qa, qb| {
                    qa.entangling_touch();
                    qb.entangling_touch();
                })?;
                self.inject_errors(ctx, &[a, b])?;
                Ok(0)
            }

            OpCode::InjectTState => {
                let kernel_id = ctx.live(&node.vqs[0])?;
                self.resources
                    .with_qubit(&kernel_id, |q| q.inject_t_state())?;
                self.inject_errors(ctx, &[kernel_id])?;
                Ok(0)
            }

            OpCode::MeasureZ | OpCode::MeasureX => {
                let basis = if node.op == OpCode::MeasureZ {
                    MeasurementBasis::Z
                } else {
                    MeasurementBasis::X
                };
                let kernel_id = ctx.live(&node.vqs[0])?;
                self.firewall.drop_vq(&kernel_id);
                let rng = &mut ctx.rng;
                let bit = self
                    .resources
                    .with_qubit(&kernel_id, |q| q.measure(basis, rng))?;
                // Measurement destroys the qubit; return its capacity now
                self.resources.free(std::slice::from_ref(&kernel_id))?;
                ctx.untrack(&kernel_id);
                ctx.bindings
                    .insert(node.vqs[0].clone(), VqBinding::Destroyed);
                ctx.events.insert(node.produces[0].clone(), bit);
                Ok(1)
            }

            OpCode::MeasureBell => {
                let a = ctx.live(&node.vqs[0])?;
                let b = ctx.live(&node.vqs[1])?;
                self.firewall
                    .authorize_interaction(&a, &b, None, &ctx.job_id)?;
                let rng = &mut ctx.rng;
                let (bit_a, bit_b) = self.resources.with_pair(&a, &b, |qa, qb| {
                    (
                        qa.measure(MeasurementBasis::Z, rng),
                        qb.measure(MeasurementBasis::Z, rng),
                    )
                })?;
                for (graph_id, kernel_id) in node.vqs.iter().zip([&a, &b]) {
                    self.firewall.drop_vq(kernel_id);
                    self.resources.free(std::slice::from_ref(kernel_id))?;
                    ctx.untrack(kernel_id);
                    ctx.bindings.insert(graph_id.clone(), VqBinding::Destroyed);
                }
                ctx.events.insert(node.produces[0].clone(), bit_a);
                ctx.events.insert(node.produces[1].clone(), bit_b);
                Ok(2)
            }

            OpCode::OpenChan => {
                let chan = node.arg_str("chan").expect("certified");
                let peers = node.arg_str_list("peers").expect("certified");
                let peer = peers
                    .iter()
                    .find(|p| **p != session.tenant)
                    .copied()
                    .expect("certified: peers names exactly one tenant other than the session tenant");

                let open = self.firewall.open_channels_for_tenant(&session.tenant);
                if open + 1 > session.quota.max_live_channels {
                    return Err(QvmError::QuotaExceeded(format!(
                        "channel would exceed the session cap of {}",
                        session.quota.max_live_channels
                    )));
                }
                if !self.firewall.has_link_consent(peer, &session.tenant) {
                    return Err(QvmError::FirewallViolation(format!(
                        "tenant '{peer}' has not consented to link with '{}'",
                        session.tenant
                    )));
                }

                let kernel_chan = format!("{}:{chan}", ctx.job_id);
                self.firewall.open_channel(
                    &kernel_chan,
                    &session.tenant,
                    peer,
                    &ctx.job_id,
                    node.args
                        .get("options")
                        .and_then(|v| v.as_object())
                        .cloned()
                        .unwrap_or_default(),
                )?;
                ctx.channel_bindings.insert(chan.to_string(), kernel_chan);
                Ok(0)
            }

            OpCode::CloseChan => {
                let chan = node.arg_str("chan").expect("certified");
                let kernel_chan = ctx
                    .channel_bindings
                    .get(chan)
                    .cloned()
                    .ok_or_else(|| QvmError::InvalidHandle(format!("channel '{chan}' unbound")))?;
                self.firewall.close_channel(&kernel_chan)?;
                Ok(0)
            }

            // Scheduling hints and checkpoint markers have no runtime effect
            OpCode::FenceEpoch | OpCode::BeginRev | OpCode::EndRev => Ok(0),
        }
    }

    /// Per-profile error injection after an operation
    fn inject_errors(&self, ctx: &mut ExecutionContext, kernel_ids: &[String]) -> Result<()> {
        let rng = &mut ctx.rng;
        for kernel_id in kernel_ids {
            self.resources.with_qubit(kernel_id, |q| {
                q.inject_error(rng);
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_model::{Capability, ParseMode};
    use crate::qvm_service::SessionQuota;
    use crate::static_verifier::{certify, VerifierOptions};

    struct Harness {
        mediator: Arc<TokenMediator>,
        resources: Arc<ResourceManager>,
        firewall: Arc<EntanglementFirewall>,
        audit: Arc<AuditLog>,
        engine: ExecutionEngine,
    }

    fn harness() -> Harness {
        let audit = Arc::new(AuditLog::new());
        let mediator = Arc::new(TokenMediator::with_key([9u8; 32], audit.clone()));
        let resources = Arc::new(ResourceManager::new(256));
        let firewall = Arc::new(EntanglementFirewall::new(resources.clone(), audit.clone()));
        let engine = ExecutionEngine::new(
            mediator.clone(),
            resources.clone(),
            firewall.clone(),
            audit.clone(),
        );
        Harness {
            mediator,
            resources,
            firewall,
            audit,
            engine,
        }
    }

    fn session(seed: u64) -> SessionContext {
        SessionContext {
            session_id: "sess-1".to_string(),
            tenant: "tenant-a".to_string(),
            job_seed: seed,
            quota: SessionQuota::default(),
        }
    }

    fn controls(total: usize) -> JobControls {
        JobControls {
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: None,
            progress: Arc::new(JobProgress::new(total)),
        }
    }

    fn bell_graph() -> ProgramGraph {
        ProgramGraph::from_json(
            r#"{
            "version": "0.1",
            "nodes": [
                {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"],
                 "args": {"n": 2, "profile": {"physical_per_logical": 4, "physical_error_rate": 0.0}},
                 "caps": ["CAP_ALLOC"], "deps": []},
                {"id": "h", "op": "APPLY_H", "vqs": ["q0"],
                 "caps": ["CAP_COMPUTE"], "deps": ["alloc"]},
                {"id": "cx", "op": "APPLY_CNOT", "vqs": ["q0", "q1"],
                 "caps": ["CAP_COMPUTE"], "deps": ["h"]},
                {"id": "m0", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["ev0"],
                 "caps": ["CAP_MEASURE"], "deps": ["cx"]},
                {"id": "m1", "op": "MEASURE_Z", "vqs": ["q1"], "produces": ["ev1"],
                 "caps": ["CAP_MEASURE"], "deps": ["cx"]},
                {"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1"],
                 "caps": ["CAP_ALLOC"], "deps": ["m0", "m1"]}
            ]
        }"#,
            ParseMode::Strict,
        )
        .unwrap()
    }

    fn certified(
        h: &Harness,
        graph: &ProgramGraph,
        caps: &[Capability],
    ) -> (Certificate, CapabilityToken) {
        let token = h.mediator.issue("tenant-a", caps, 600, 100_000);
        let options = VerifierOptions {
            session_tenant: "tenant-a".to_string(),
            advertise_rollback: false,
        };
        let cert = certify(graph, &token, &options).unwrap();
        (cert, token)
    }

    #[test]
    fn test_bell_graph_executes_and_unloads() {
        let h = harness();
        let graph = bell_graph();
        let (cert, token) = certified(
            &h,
            &graph,
            &[Capability::Alloc, Capability::Compute, Capability::Measure],
        );

        let outcome = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls(graph.nodes.len()),
        );

        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.ops_executed, 6);
        assert!(outcome.events.contains_key("ev0"));
        assert!(outcome.events.contains_key("ev1"));
        assert!(outcome.events.values().all(|b| *b <= 1));

        // No leaked qubits after UNLOAD
        assert_eq!(h.resources.live_total(), 0);

        let executed = h.audit.query_by_kind(AuditEventKind::OperationExecuted);
        assert_eq!(executed.len(), 6);
        assert_eq!(h.audit.query_by_kind(AuditEventKind::UnloadCompleted).len(), 1);
    }

    #[test]
    fn test_same_seed_reproduces_events_and_leaf_sequence() {
        let run = |seed: u64| {
            let h = harness();
            let graph = bell_graph();
            let (cert, token) = certified(
                &h,
                &graph,
                &[Capability::Alloc, Capability::Compute, Capability::Measure],
            );
            let outcome = h.engine.execute(
                "job-1",
                &graph,
                &cert,
                &token,
                &session(seed),
                &controls(graph.nodes.len()),
            );
            // Token and kernel qubit ids are random; substitute them so the
            // comparison sees only the deterministic shape of the sequence
            let leaf_kinds: Vec<_> = h
                .audit
                .leaves()
                .into_iter()
                .map(|leaf| {
                    let subjects: Vec<String> = leaf
                        .subject_ids
                        .iter()
                        .map(|s| {
                            if s == &token.id {
                                "TOKEN".to_string()
                            } else if s.starts_with("vq-") {
                                "VQ".to_string()
                            } else {
                                s.clone()
                            }
                        })
                        .collect();
                    (leaf.kind, subjects)
                })
                .collect();
            (outcome.events, leaf_kinds)
        };

        let (events_a, leaves_a) = run(42);
        let (events_b, leaves_b) = run(42);
        assert_eq!(events_a, events_b);
        assert_eq!(leaves_a, leaves_b);
    }

    #[test]
    fn test_certificate_mismatch_refuses_execution() {
        let h = harness();
        let graph = bell_graph();
        let (cert, token) = certified(
            &h,
            &graph,
            &[Capability::Alloc, Capability::Compute, Capability::Measure],
        );

        let mut other = graph.clone();
        other.nodes[1].op = OpCode::ApplyX;

        let outcome = h.engine.execute(
            "job-1",
            &other,
            &cert,
            &token,
            &session(42),
            &controls(other.nodes.len()),
        );
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.ops_executed, 0);
        assert!(matches!(outcome.error, Some(QvmError::AuthFailed(_))));
    }

    #[test]
    fn test_cancellation_between_nodes_unloads() {
        let h = harness();
        let graph = bell_graph();
        let (cert, token) = certified(
            &h,
            &graph,
            &[Capability::Alloc, Capability::Compute, Capability::Measure],
        );

        let controls = controls(graph.nodes.len());
        controls.cancel.store(true, Ordering::Relaxed);

        let outcome = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls,
        );
        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.ops_executed, 0);
        assert!(matches!(outcome.error, Some(QvmError::Cancelled)));
        assert_eq!(h.resources.live_total(), 0);
        assert_eq!(h.audit.query_by_kind(AuditEventKind::UnloadCompleted).len(), 1);
    }

    #[test]
    fn test_expired_deadline_cancels_cleanly() {
        let h = harness();
        let graph = bell_graph();
        let (cert, token) = certified(
            &h,
            &graph,
            &[Capability::Alloc, Capability::Compute, Capability::Measure],
        );

        let controls = JobControls {
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() - std::time::Duration::from_millis(1)),
            progress: Arc::new(JobProgress::new(graph.nodes.len())),
        };
        let outcome = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls,
        );
        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(matches!(outcome.error, Some(QvmError::Timeout(_))));
        assert_eq!(h.resources.live_total(), 0);
    }

    #[test]
    fn test_runtime_token_exhaustion_fails_job_and_unloads() {
        let h = harness();
        let graph = bell_graph();
        let token = h.mediator.issue(
            "tenant-a",
            &[Capability::Alloc, Capability::Compute, Capability::Measure],
            600,
            3, // enough for alloc, h, cx; the first measure exhausts it
        );
        let options = VerifierOptions {
            session_tenant: "tenant-a".to_string(),
            advertise_rollback: false,
        };
        let cert = certify(&graph, &token, &options).unwrap();

        let outcome = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls(graph.nodes.len()),
        );
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.ops_executed, 3);
        assert_eq!(outcome.halted_at.as_deref(), Some("m0"));
        assert!(matches!(outcome.error, Some(QvmError::TokenRejected(_))));
        assert_eq!(h.resources.live_total(), 0);
    }

    #[test]
    fn test_false_guard_skips_node_without_side_effects() {
        let h = harness();
        let graph = ProgramGraph::from_json(
            r#"{
            "version": "0.1",
            "nodes": [
                {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"],
                 "args": {"n": 2, "profile": {"physical_per_logical": 2, "physical_error_rate": 0.0}},
                 "caps": ["CAP_ALLOC"], "deps": []},
                {"id": "m", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["ev"],
                 "caps": ["CAP_MEASURE"], "deps": ["alloc"]},
                {"id": "never", "op": "MEASURE_X", "vqs": ["q1"], "produces": ["ev_never"],
                 "caps": ["CAP_MEASURE"], "deps": ["m"],
                 "guard": {"kind": "false"}},
                {"id": "always", "op": "MEASURE_Z", "vqs": ["q1"], "produces": ["ev_always"],
                 "caps": ["CAP_MEASURE"], "deps": ["m"],
                 "guard": {"kind": "true"}}
            ]
        }"#,
            ParseMode::Strict,
        )
        .unwrap();
        let (cert, token) = certified(
            &h,
            &graph,
            &[Capability::Alloc, Capability::Measure],
        );

        let outcome = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls(graph.nodes.len()),
        );
        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.ops_executed, 3); // alloc, m, always
        assert!(!outcome.events.contains_key("ev_never"));
        assert!(outcome.events.contains_key("ev_always"));
        assert_eq!(h.resources.live_total(), 0);
    }

    #[test]
    fn test_guarded_branches_follow_measured_event() {
        // X-basis measurement of |0⟩ is a coin flip; the branch taken must
        // match the measured bit, and the other branch must not run.
        let h = harness();
        let graph = ProgramGraph::from_json(
            r#"{
            "version": "0.1",
            "nodes": [
                {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"],
                 "args": {"n": 2, "profile": {"physical_per_logical": 2, "physical_error_rate": 0.0}},
                 "caps": ["CAP_ALLOC"], "deps": []},
                {"id": "m", "op": "MEASURE_X", "vqs": ["q0"], "produces": ["coin"],
                 "caps": ["CAP_MEASURE"], "deps": ["alloc"]},
                {"id": "on_one", "op": "APPLY_X", "vqs": ["q1"],
                 "caps": ["CAP_COMPUTE"], "deps": ["m"],
                 "guard": {"kind": "eq", "event": "coin", "value": 1}},
                {"id": "on_zero", "op": "APPLY_H", "vqs": ["q1"],
                 "caps": ["CAP_COMPUTE"], "deps": ["m"],
                 "guard": {"kind": "eq", "event": "coin", "value": 0}},
                {"id": "out", "op": "MEASURE_Z", "vqs": ["q1"], "produces": ["out"],
                 "caps": ["CAP_MEASURE"], "deps": ["on_one", "on_zero"]}
            ]
        }"#,
            ParseMode::Strict,
        )
        .unwrap();
        let (cert, token) = certified(
            &h,
            &graph,
            &[Capability::Alloc, Capability::Compute, Capability::Measure],
        );

        let outcome = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls(graph.nodes.len()),
        );
        assert_eq!(outcome.state, JobState::Completed);
        // alloc + m + exactly one branch + out
        assert_eq!(outcome.ops_executed, 4);
        assert!(outcome.events.contains_key("coin"));
        assert!(outcome.events.contains_key("out"));
    }

    #[test]
    fn test_allocation_over_quota_fails_job() {
        let h = harness();
        let graph = ProgramGraph::from_json(
            r#"{
            "version": "0.1",
            "nodes": [
                {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1", "q2"],
                 "args": {"n": 3, "profile": {"physical_per_logical": 2}},
                 "caps": ["CAP_ALLOC"], "deps": []},
                {"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1", "q2"],
                 "caps": ["CAP_ALLOC"], "deps": ["alloc"]}
            ]
        }"#,
            ParseMode::Strict,
        )
        .unwrap();
        let (cert, token) = certified(&h, &graph, &[Capability::Alloc]);

        let mut tight = session(42);
        tight.quota.max_live_vqs = 2;

        let outcome = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &tight,
            &controls(graph.nodes.len()),
        );
        assert_eq!(outcome.state, JobState::Failed);
        assert!(matches!(outcome.error, Some(QvmError::QuotaExceeded(_))));
        assert_eq!(h.resources.live_total(), 0);
    }

    #[test]
    fn test_open_chan_requires_peer_consent() {
        let h = harness();
        let graph = ProgramGraph::from_json(
            r#"{
            "version": "0.1",
            "nodes": [
                {"id": "open", "op": "OPEN_CHAN",
                 "args": {"chan": "ch0", "peers": ["tenant-a", "tenant-b"]},
                 "caps": ["CAP_LINK"], "deps": []},
                {"id": "close", "op": "CLOSE_CHAN", "args": {"chan": "ch0"},
                 "caps": ["CAP_LINK"], "deps": ["open"]}
            ]
        }"#,
            ParseMode::Strict,
        )
        .unwrap();
        let (cert, token) = certified(&h, &graph, &[Capability::Link]);

        // Without peer consent the open is refused
        let refused = h.engine.execute(
            "job-1",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls(graph.nodes.len()),
        );
        assert_eq!(refused.state, JobState::Failed);
        assert!(matches!(refused.error, Some(QvmError::FirewallViolation(_))));

        h.firewall.record_link_consent("tenant-b", "tenant-a");
        let allowed = h.engine.execute(
            "job-2",
            &graph,
            &cert,
            &token,
            &session(42),
            &controls(graph.nodes.len()),
        );
        assert_eq!(allowed.state, JobState::Completed);
        assert_eq!(h.firewall.channels_open(), 0); // closed by the graph
    }
}
