//! # QVM Service - Sessions, Quotas, and the Admission Interface
//!
//! The orchestration facade over the substrate: owns the session registry and
//! job table, wires the capability mediator, resource manager, entanglement
//! firewall, audit log, and execution engine together behind shared handles,
//! and exposes the admission interface consumed by the RPC layer:
//!
//! ```text
//! submit(session_id, graph, token) → Result<JobHandle>
//! status(job_handle)               → {state, events_so_far, progress}
//! cancel(job_handle)               → Result<()>
//! wait(job_handle, timeout_ms)     → Result<FinalResult>
//! ```
//!
//! Jobs execute on blocking worker threads; the engine itself is synchronous
//! and cooperative, so the async surface here is only scheduling and waiting.
//!
//! ## Sessions
//!
//! A session is a bounded lifetime window binding a tenant to a quota and a
//! deterministic job seed. Closing a session forcibly frees every live
//! virtual qubit the tenant holds and closes its channels — the physical
//! reservation is zeroed.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::audit_log::{AuditEventKind, AuditLog};
use crate::capability_mediator::{CapabilityToken, TokenMediator};
use crate::entanglement_firewall::EntanglementFirewall;
use crate::execution_engine::{ExecutionEngine, JobControls, JobProgress, JobState};
use crate::graph_model::{CapabilitySet, ParseMode, ProgramGraph};
use crate::logging::{log_info, LogCategory, PerformanceTimer};
use crate::resource_manager::{ResourceManager, ResourceSnapshot};
use crate::static_verifier::{certify, VerifierOptions};
use crate::{QvmError, Result, SubstrateMetrics};

/// Per-session resource ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuota {
    pub max_live_vqs: usize,
    pub max_live_channels: usize,
    pub max_concurrent_jobs: usize,
}

impl Default for SessionQuota {
    fn default() -> Self {
        Self {
            max_live_vqs: 64,
            max_live_channels: 8,
            max_concurrent_jobs: 4,
        }
    }
}

/// Immutable per-session facts handed to the engine with every job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub tenant: String,
    /// Seed for the per-job PRNG; same seed reproduces every event value
    pub job_seed: u64,
    pub quota: SessionQuota,
}

/// Substrate configuration
///
/// Plain serde value; construct with `Default`, the presets, or struct
/// update syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateConfig {
    /// Physical qubit pool size shared by all tenants
    pub total_physical_qubits: usize,
    /// Reject unknown wire fields when parsing graphs
    pub strict_parsing: bool,
    pub default_quota: SessionQuota,
    /// Job seed for sessions that do not supply their own
    pub default_job_seed: u64,
    /// Per-job wall-clock ceiling, enforced between node dispatches
    pub job_timeout_ms: u64,
    /// Advertise rollback support; rollback fences then require checkpoint
    /// markers at admission
    pub advertise_rollback: bool,
    /// Optional per-tenant ceiling on capability checks per minute
    pub check_rate_limit_per_min: Option<u32>,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            total_physical_qubits: 4096,
            strict_parsing: true,
            default_quota: SessionQuota::default(),
            default_job_seed: 42,
            job_timeout_ms: 30_000,
            advertise_rollback: false,
            check_rate_limit_per_min: None,
        }
    }
}

impl SubstrateConfig {
    /// Production defaults: large pool, strict parsing, rate limiting on
    pub fn production_ready() -> Self {
        Self {
            total_physical_qubits: 65_536,
            check_rate_limit_per_min: Some(100_000),
            ..Self::default()
        }
    }

    /// Tightest isolation: small per-session quotas and short job deadlines
    pub fn maximum_isolation() -> Self {
        Self {
            default_quota: SessionQuota {
                max_live_vqs: 8,
                max_live_channels: 1,
                max_concurrent_jobs: 1,
            },
            job_timeout_ms: 5_000,
            check_rate_limit_per_min: Some(10_000),
            ..Self::default()
        }
    }
}

/// Opaque session reference returned by `open_session`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    id: String,
    tenant: String,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

/// Opaque job reference returned by `submit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub session_id: String,
}

/// Point-in-time view of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub events_so_far: usize,
    /// Fraction of graph nodes dispatched, in `[0, 1]`
    pub progress: f64,
    pub current_node: Option<String>,
    pub error: Option<QvmError>,
}

/// Final result surfaced by `wait`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub state: JobState,
    pub events: BTreeMap<String, u8>,
    pub ops_executed: u64,
    pub error: Option<QvmError>,
}

struct JobRecord {
    session_id: String,
    cancel: Arc<AtomicBool>,
    progress: Arc<JobProgress>,
    state: Arc<RwLock<JobState>>,
    result: Arc<RwLock<Option<FinalResult>>>,
    done: Arc<tokio::sync::Notify>,
}

impl JobRecord {
    fn is_terminal(&self) -> bool {
        matches!(
            *self.state.read(),
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// The substrate service facade
pub struct QvmService {
    config: SubstrateConfig,
    audit: Arc<AuditLog>,
    mediator: Arc<TokenMediator>,
    resources: Arc<ResourceManager>,
    firewall: Arc<EntanglementFirewall>,
    engine: Arc<ExecutionEngine>,
    sessions: DashMap<String, SessionContext>,
    jobs: DashMap<String, Arc<JobRecord>>,
    metrics: Arc<RwLock<SubstrateMetrics>>,
}

impl QvmService {
    pub fn new() -> Self {
        Self::with_config(SubstrateConfig::default())
    }

    pub fn with_config(config: SubstrateConfig) -> Self {
        let audit = Arc::new(AuditLog::new());
        let mut mediator = TokenMediator::new(audit.clone());
        if let Some(limit) = config.check_rate_limit_per_min {
            mediator = mediator.with_rate_limit(limit);
        }
        let mediator = Arc::new(mediator);
        let resources = Arc::new(ResourceManager::new(config.total_physical_qubits));
        let firewall = Arc::new(EntanglementFirewall::new(resources.clone(), audit.clone()));
        let engine = Arc::new(ExecutionEngine::new(
            mediator.clone(),
            resources.clone(),
            firewall.clone(),
            audit.clone(),
        ));

        log_info(
            LogCategory::System,
            &format!(
                "substrate initialized: {} physical qubits, strict_parsing={}",
                config.total_physical_qubits, config.strict_parsing
            ),
        );

        Self {
            config,
            audit,
            mediator,
            resources,
            firewall,
            engine,
            sessions: DashMap::new(),
            jobs: DashMap::new(),
            metrics: Arc::new(RwLock::new(SubstrateMetrics::new())),
        }
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    pub fn mediator(&self) -> &Arc<TokenMediator> {
        &self.mediator
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn firewall(&self) -> &Arc<EntanglementFirewall> {
        &self.firewall
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Parse discipline implied by the configuration
    pub fn parse_mode(&self) -> ParseMode {
        if self.config.strict_parsing {
            ParseMode::Strict
        } else {
            ParseMode::Compatible
        }
    }

    /// Open a session binding `tenant` to the default quota and job seed
    pub fn open_session(&self, tenant: &str, token: &CapabilityToken) -> Result<SessionHandle> {
        self.open_session_with(tenant, token, self.config.default_quota, self.config.default_job_seed)
    }

    /// Open a session with an explicit quota and job seed
    ///
    /// # Errors
    ///
    /// `AuthFailed` when the token is bound to a different tenant;
    /// `TokenRejected` when it does not verify.
    pub fn open_session_with(
        &self,
        tenant: &str,
        token: &CapabilityToken,
        quota: SessionQuota,
        job_seed: u64,
    ) -> Result<SessionHandle> {
        if token.tenant != tenant {
            return Err(QvmError::AuthFailed(format!(
                "token is bound to tenant '{}'",
                token.tenant
            )));
        }
        self.mediator.verify(token)?;

        let session_id = format!("sess-{}", Uuid::new_v4());
        self.sessions.insert(
            session_id.clone(),
            SessionContext {
                session_id: session_id.clone(),
                tenant: tenant.to_string(),
                job_seed,
                quota,
            },
        );
        self.audit.append(
            AuditEventKind::SessionOpened,
            tenant,
            vec![session_id.clone()],
            json!({"quota": quota, "job_seed": job_seed}),
        );
        Ok(SessionHandle {
            id: session_id,
            tenant: tenant.to_string(),
        })
    }

    /// Terminate a session, forcibly freeing all tenant qubits and channels
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown session id.
    pub fn close_session(&self, session: &SessionHandle) -> Result<()> {
        let (_, context) = self
            .sessions
            .remove(session.id())
            .ok_or_else(|| QvmError::NotFound(format!("session '{}'", session.id())))?;

        // Request cancellation of anything still running under the session
        for entry in self.jobs.iter() {
            if entry.value().session_id == context.session_id {
                entry.value().cancel.store(true, Ordering::Relaxed);
            }
        }

        let freed = self.resources.free_tenant(&context.tenant);
        let closed = self.firewall.close_tenant_channels(&context.tenant);
        self.audit.append(
            AuditEventKind::SessionClosed,
            &context.tenant,
            vec![context.session_id.clone()],
            json!({"qubits_freed": freed, "channels_closed": closed}),
        );
        Ok(())
    }

    /// Record one tenant's consent to entanglement channels with a peer
    ///
    /// # Errors
    ///
    /// `AuthFailed` for a token of the wrong tenant, `TokenRejected` when the
    /// token does not verify, `MissingCapability` without `CAP_LINK`.
    pub fn register_link_consent(
        &self,
        tenant: &str,
        peer_tenant: &str,
        token: &CapabilityToken,
    ) -> Result<()> {
        if token.tenant != tenant {
            return Err(QvmError::AuthFailed(format!(
                "token is bound to tenant '{}'",
                token.tenant
            )));
        }
        self.mediator.verify(token)?;
        if !token.caps.contains(CapabilitySet::LINK) {
            return Err(QvmError::MissingCapability {
                required: CapabilitySet::LINK,
                granted: token.caps,
            });
        }
        self.firewall.record_link_consent(tenant, peer_tenant);
        Ok(())
    }

    fn active_jobs_for(&self, session_id: &str) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.value().session_id == session_id && !entry.value().is_terminal())
            .count()
    }

    /// Submit a graph for certification and execution
    ///
    /// On success the job is already scheduled; poll with `status` or block
    /// with `wait`. Admission failures leave the session unchanged.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown session, `AuthFailed` for a token of another
    /// tenant, `TokenRejected` before any graph verification, `QuotaExceeded`
    /// over the concurrent-job cap, and `Verification` with the violated rule.
    pub async fn submit(
        &self,
        session_id: &str,
        graph: ProgramGraph,
        token: CapabilityToken,
    ) -> Result<JobHandle> {
        let session = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QvmError::NotFound(format!("session '{session_id}'")))?;

        if token.tenant != session.tenant {
            return Err(QvmError::AuthFailed(format!(
                "token is bound to tenant '{}'",
                token.tenant
            )));
        }
        // Token health comes first: a revoked token is rejected before any
        // graph verification happens.
        if let Err(err) = self.mediator.verify(&token) {
            self.audit.append(
                AuditEventKind::AdmissionRejected,
                &session.tenant,
                vec![token.id.clone()],
                json!({"error": err.to_string()}),
            );
            return Err(err);
        }

        if self.active_jobs_for(session_id) >= session.quota.max_concurrent_jobs {
            return Err(QvmError::QuotaExceeded(format!(
                "session cap of {} concurrent jobs",
                session.quota.max_concurrent_jobs
            )));
        }

        let job_id = format!("job-{}", Uuid::new_v4());
        let timer = PerformanceTimer::start_for_job(
            LogCategory::Admission,
            "certify",
            job_id.clone(),
        );
        let options = VerifierOptions {
            session_tenant: session.tenant.clone(),
            advertise_rollback: self.config.advertise_rollback,
        };
        let admission_started = Instant::now();
        let certificate = match certify(&graph, &token, &options) {
            Ok(cert) => cert,
            Err(err) => {
                self.metrics
                    .write()
                    .record_admission(false, admission_started.elapsed().as_secs_f64() * 1e3);
                self.audit.append(
                    AuditEventKind::AdmissionRejected,
                    &session.tenant,
                    vec![job_id],
                    json!({"error": err.to_string()}),
                );
                return Err(err);
            }
        };
        self.metrics
            .write()
            .record_admission(true, admission_started.elapsed().as_secs_f64() * 1e3);
        timer.finish();

        self.audit.append(
            AuditEventKind::AdmissionCertified,
            &session.tenant,
            vec![job_id.clone()],
            json!({
                "token": token.id,
                "nodes": graph.nodes.len(),
                "rev_segments": certificate.rev_segments.len(),
            }),
        );

        let record = Arc::new(JobRecord {
            session_id: session_id.to_string(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(JobProgress::new(graph.nodes.len())),
            state: Arc::new(RwLock::new(JobState::Loaded)),
            result: Arc::new(RwLock::new(None)),
            done: Arc::new(tokio::sync::Notify::new()),
        });
        self.jobs.insert(job_id.clone(), record.clone());

        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        let controls = JobControls {
            cancel: record.cancel.clone(),
            deadline: Some(Instant::now() + Duration::from_millis(self.config.job_timeout_ms)),
            progress: record.progress.clone(),
        };
        let runner_record = record.clone();
        let runner_job_id = job_id.clone();

        tokio::task::spawn_blocking(move || {
            *runner_record.state.write() = JobState::Running;
            let started = Instant::now();
            let outcome =
                engine.execute(&runner_job_id, &graph, &certificate, &token, &session, &controls);

            {
                let mut m = metrics.write();
                m.record_execution(started.elapsed().as_secs_f64() * 1e3);
                m.operations_executed += outcome.ops_executed;
                match outcome.state {
                    JobState::Completed => m.jobs_completed += 1,
                    JobState::Cancelled => m.jobs_cancelled += 1,
                    _ => m.jobs_failed += 1,
                }
            }

            *runner_record.state.write() = outcome.state;
            *runner_record.result.write() = Some(FinalResult {
                state: outcome.state,
                events: outcome.events,
                ops_executed: outcome.ops_executed,
                error: outcome.error,
            });
            runner_record.done.notify_waiters();
        });

        Ok(JobHandle {
            id: job_id,
            session_id: session_id.to_string(),
        })
    }

    /// Point-in-time view of a job
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown job id.
    pub fn status(&self, job: &JobHandle) -> Result<JobStatus> {
        let record = self
            .jobs
            .get(&job.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QvmError::NotFound(format!("job '{}'", job.id)))?;

        let error = record
            .result
            .read()
            .as_ref()
            .and_then(|r| r.error.clone());
        let state = *record.state.read();
        Ok(JobStatus {
            state,
            events_so_far: record.progress.events_so_far(),
            progress: record.progress.fraction(),
            current_node: record.progress.current_node(),
            error,
        })
    }

    /// Request cooperative cancellation; takes effect between node dispatches
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown job id.
    pub fn cancel(&self, job: &JobHandle) -> Result<()> {
        let record = self
            .jobs
            .get(&job.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QvmError::NotFound(format!("job '{}'", job.id)))?;
        record.cancel.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Block until the job reaches a terminal state or the wait times out
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown job id, `Timeout` when the deadline elapses
    /// first (the job keeps running).
    pub async fn wait(&self, job: &JobHandle, timeout_ms: u64) -> Result<FinalResult> {
        let record = self
            .jobs
            .get(&job.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QvmError::NotFound(format!("job '{}'", job.id)))?;

        let deadline = Duration::from_millis(timeout_ms);
        let waited = tokio::time::timeout(deadline, async {
            loop {
                // Register for the wakeup before checking, so a notify that
                // lands between the check and the await is not lost
                let notified = record.done.notified();
                if let Some(result) = record.result.read().clone() {
                    return result;
                }
                notified.await;
            }
        })
        .await;

        waited.map_err(|_| QvmError::Timeout(format!("job '{}' still running", job.id)))
    }

    /// Aggregate substrate metrics
    pub fn metrics(&self) -> SubstrateMetrics {
        self.metrics.read().clone()
    }

    /// Pool telemetry including open channel count
    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        self.resources.snapshot(self.firewall.channels_open())
    }

    /// Aggregate status view for operational dashboards
    pub fn get_system_status(&self) -> std::collections::HashMap<String, serde_json::Value> {
        let mut status = std::collections::HashMap::new();
        status.insert(
            "architecture_version".to_string(),
            json!(crate::ARCHITECTURE_VERSION),
        );
        status.insert("sessions_open".to_string(), json!(self.sessions.len()));
        status.insert("jobs_tracked".to_string(), json!(self.jobs.len()));
        status.insert("resources".to_string(), json!(self.resource_snapshot()));
        status.insert("metrics".to_string(), json!(self.metrics()));
        status.insert("audit_leaves".to_string(), json!(self.audit.len()));
        status.insert(
            "audit_root".to_string(),
            json!(self.audit.root().map(hex_digest)),
        );
        status
    }

    /// Cheap internal consistency check
    ///
    /// Recomputes the audit root from the leaf hashes and validates the pool
    /// accounting against the configured capacity.
    pub fn health_check(&self) -> Result<bool> {
        let hashes = self.audit.leaf_hashes();
        if self.audit.root() != crate::audit_log::compute_root(&hashes) {
            return Ok(false);
        }
        let snapshot = self.resource_snapshot();
        Ok(snapshot.physical_qubits_in_use <= self.config.total_physical_qubits)
    }
}

fn hex_digest(bytes: [u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Default for QvmService {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience constructor for tests and examples
pub fn create_test_service() -> QvmService {
    QvmService::with_config(SubstrateConfig {
        total_physical_qubits: 512,
        ..SubstrateConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_model::Capability;

    fn trivial_graph() -> ProgramGraph {
        ProgramGraph::from_json(
            r#"{"version": "0.1", "nodes": [
                {"id": "fence", "op": "FENCE_EPOCH", "deps": []}
            ]}"#,
            ParseMode::Strict,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_requires_a_known_session() {
        let service = create_test_service();
        let token = service.mediator().issue("tenant-a", &[Capability::Alloc], 60, 10);
        let err = service
            .submit("sess-unknown", trivial_graph(), token)
            .await
            .unwrap_err();
        assert!(matches!(err, QvmError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_open_session_rejects_foreign_token() {
        let service = create_test_service();
        let token = service.mediator().issue("tenant-b", &[Capability::Alloc], 60, 10);
        let err = service.open_session("tenant-a", &token).unwrap_err();
        assert!(matches!(err, QvmError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_trivial_job_completes_through_the_facade() {
        let service = create_test_service();
        let token = service.mediator().issue("tenant-a", &[Capability::Alloc], 600, 100);
        let session = service.open_session("tenant-a", &token).unwrap();

        let job = service
            .submit(session.id(), trivial_graph(), token)
            .await
            .unwrap();
        let result = service.wait(&job, 5_000).await.unwrap();
        assert_eq!(result.state, JobState::Completed);
        assert_eq!(result.ops_executed, 1);

        let status = service.status(&job).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!((status.progress - 1.0).abs() < f64::EPSILON);

        let metrics = service.metrics();
        assert_eq!(metrics.graphs_admitted, 1);
        assert_eq!(metrics.jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_job_quota_is_enforced() {
        let service = create_test_service();
        let token = service.mediator().issue("tenant-a", &[Capability::Alloc], 600, 100);
        let quota = SessionQuota {
            max_concurrent_jobs: 0,
            ..SessionQuota::default()
        };
        let session = service
            .open_session_with("tenant-a", &token, quota, 42)
            .unwrap();

        let err = service
            .submit(session.id(), trivial_graph(), token)
            .await
            .unwrap_err();
        assert!(matches!(err, QvmError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_wait_on_an_unknown_job_is_not_found() {
        let service = create_test_service();
        let err = service
            .wait(
                &JobHandle {
                    id: "job-ghost".to_string(),
                    session_id: "sess-ghost".to_string(),
                },
                10,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QvmError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_system_status_and_health_check() {
        let service = create_test_service();
        let token = service.mediator().issue("tenant-a", &[Capability::Alloc], 600, 100);
        let session = service.open_session("tenant-a", &token).unwrap();
        let job = service
            .submit(session.id(), trivial_graph(), token)
            .await
            .unwrap();
        service.wait(&job, 5_000).await.unwrap();

        let status = service.get_system_status();
        assert_eq!(
            status["architecture_version"],
            serde_json::json!(crate::ARCHITECTURE_VERSION)
        );
        assert_eq!(status["sessions_open"], serde_json::json!(1));
        assert!(status["audit_leaves"].as_u64().unwrap() > 0);
        assert!(status["audit_root"].is_string());

        assert!(service.health_check().unwrap());
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent_only_once() {
        let service = create_test_service();
        let token = service.mediator().issue("tenant-a", &[Capability::Alloc], 600, 100);
        let session = service.open_session("tenant-a", &token).unwrap();

        service.close_session(&session).unwrap();
        assert!(matches!(
            service.close_session(&session),
            Err(QvmError::NotFound(_))
        ));

        let closed = service.audit().query_by_kind(AuditEventKind::SessionClosed);
        assert_eq!(closed.len(), 1);
    }
}
