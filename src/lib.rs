//! # QVM Substrate v0.1.0
//!
//! A capability-secured Quantum Virtual Machine execution substrate implementing
//! static graph certification, unforgeable capability tokens, multi-tenant qubit
//! isolation, and deterministic fault-tolerant logical-qubit execution.
//!
//! ## 🔬 Capability-Secured Execution
//!
//! Every privileged operation in the substrate is gated by an unforgeable token:
//! - **HMAC-SHA-256 Signatures**: Tokens are bound to their fields by a keyed MAC
//! - **Attenuation Chains**: Tokens mint narrower, shorter-lived children
//! - **Transitive Revocation**: Revoking a parent invalidates every descendant
//! - **Atomic Mediation**: Verify, coverage check, and use-count increment in one step
//!
//! ## 🏗️ Architecture Overview
//!
//! The substrate implements an eight-component layered architecture, admitted
//! front-to-back and executed under per-tenant isolation:
//!
//! ### Graph Model
//! - **Closed opcode set**: Tagged sum type over the full QVM instruction catalogue
//! - **Canonical wire format**: UTF-8 JSON with strict and compatibility parse modes
//! - **Guard expressions**: Finite Boolean predicates over measurement events
//!
//! ### Static Verifier
//! - **Single-pass certification**: Fail-fast stages bound worst-case admission time
//! - **Linearity tracking**: Use-after-free, double-consume, and leak detection for
//!   virtual qubits and entanglement channels
//! - **Branch exclusivity**: Guard satisfiability over event literals lets mutually
//!   exclusive branches each consume the same handle
//! - **Certificates**: Opaque proof values binding a graph fingerprint to a token
//!
//! ### Capability Mediator
//! - **Issue / attenuate / revoke**: Full token lifecycle with parent chaining
//! - **Constant-time verification**: MAC comparison never leaks timing
//! - **Rate limiting**: Optional per-tenant ceilings on mediated check calls
//!
//! ### Resource Manager & Entanglement Firewall
//! - **Exclusive physical allocation**: Physical qubits are never shared across
//!   tenants and are zeroed before reallocation
//! - **Entanglement relation graph**: Cross-tenant interaction requires a live,
//!   mutually agreed channel
//!
//! ### Logical Qubit Model
//! - **Discrete basis abstraction**: `{Z0, Z1, X+, X-, Unknown}` with deterministic
//!   Clifford transitions and seeded measurement of unknown states
//! - **QEC profiles**: Opaque code descriptors with per-profile error injection
//!
//! ### Execution Engine
//! - **Topological dispatch**: Program order equals the certified topological order
//! - **Guard-conditional branches**: False guards skip nodes in zero operations
//! - **UNLOAD-always cleanup**: A drop-guarded context frees every live resource on
//!   every exit path, success or failure
//!
//! ### Audit Log
//! - **Tamper-evident records**: SHA-256 Merkle accumulation over append-only leaves
//! - **Third-party verification**: Roots recomputable from the leaf sequence alone
//!
//! ## ⚡ Performance Characteristics
//!
//! - **Admission**: Single pass over the graph; early rejection on first violation
//! - **Execution**: Cooperative single-threaded per job, parallel OS threads across
//!   jobs; no suspension inside a node and no external I/O in the core
//! - **Latency profile**: The only blocking is brief mutex acquisition
//!
//! ## 🔐 Security Guarantees
//!
//! - **No forged handles**: The engine accepts only ids the certified graph introduced
//! - **No capability escalation**: Attenuation can only narrow; coverage is checked
//!   statically and re-checked per operation at runtime
//! - **No cross-tenant entanglement**: The firewall refuses two-qubit interactions
//!   between tenants without a live channel
//! - **Reproducibility**: Every nondeterministic draw comes from one ChaCha20 PRNG
//!   seeded by the session job seed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qvm_substrate::{QvmService, SubstrateConfig};
//! use qvm_substrate::graph_model::{Capability, ParseMode, ProgramGraph};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Create the substrate service with default configuration
//!     let service = QvmService::with_config(SubstrateConfig::default());
//!
//!     // Issue a capability token and open a tenant session
//!     let token = service.mediator().issue(
//!         "tenant-a",
//!         &[Capability::Alloc, Capability::Compute, Capability::Measure],
//!         3600,
//!         1000,
//!     );
//!     let session = service.open_session("tenant-a", &token)?;
//!
//!     // Parse, certify, and execute a program graph
//!     let graph = ProgramGraph::from_json(r#"{"version":"0.1","nodes":[]}"#, ParseMode::Strict)?;
//!     let job = service.submit(session.id(), graph, token.clone()).await?;
//!     let result = service.wait(&job, 5_000).await?;
//!     println!("final state: {:?}", result.state);
//!     Ok(())
//! }
//! ```

/// Architecture version for compatibility tracking and upgrade management
///
/// This version string is used for:
/// - Graph wire-format compatibility checking
/// - Certificate fingerprint domain separation
/// - Documentation versioning
pub const ARCHITECTURE_VERSION: &str = "0.1.0-substrate";

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph_model::CapabilitySet;

/// Aggregate counters for admissions and executions across the substrate
///
/// Maintained by the service facade and exposed read-only. Averages are running
/// means over completed operations of each class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstrateMetrics {
    pub graphs_admitted: u64,
    pub graphs_rejected: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub operations_executed: u64,
    pub avg_admission_ms: f64,
    pub avg_execution_ms: f64,
}

impl SubstrateMetrics {
    /// Create a new metrics record with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an admission duration into the running mean
    pub fn record_admission(&mut self, accepted: bool, elapsed_ms: f64) {
        let n = (self.graphs_admitted + self.graphs_rejected) as f64;
        self.avg_admission_ms = (self.avg_admission_ms * n + elapsed_ms) / (n + 1.0);
        if accepted {
            self.graphs_admitted += 1;
        } else {
            self.graphs_rejected += 1;
        }
    }

    /// Fold an execution duration into the running mean
    pub fn record_execution(&mut self, elapsed_ms: f64) {
        let n = (self.jobs_completed + self.jobs_failed + self.jobs_cancelled) as f64;
        self.avg_execution_ms = (self.avg_execution_ms * n + elapsed_ms) / (n + 1.0);
    }
}

// Production hardening modules
pub mod logging; // Structured logging, performance timers, operational telemetry

// Core substrate modules
pub mod audit_log; // Append-only Merkle-accumulating audit record
pub mod capability_mediator; // Token issue/verify/attenuate/revoke and operation mediation
pub mod entanglement_firewall; // Qubit ownership map and cross-tenant entanglement policy
pub mod execution_engine; // Topological certified-graph interpreter with UNLOAD-always cleanup
pub mod graph_model; // Node/graph data types, opcode catalogue, guard AST, wire format
pub mod logical_qubit; // Discrete fault-tolerant logical-qubit model with QEC profiles
pub mod qvm_service; // Session registry, quotas, and the admission interface
pub mod resource_manager; // Physical qubit pool and per-tenant exclusive allocation
pub mod static_verifier; // Single-pass graph certification producing Certificates

// Re-export the service facade for convenient access
pub use qvm_service::*;

/// Reason a capability token failed verification
///
/// Ordered by check sequence: the MAC is validated first, then expiry, then
/// revocation (transitive along the parent chain), then the use-count bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// MAC mismatch against the mediator's secret key
    BadSignature,
    /// Current time is past the token's expiry
    Expired,
    /// Token id or an ancestor id is in the revoked set
    Revoked,
    /// Use count has reached the token's ceiling
    Exhausted,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::BadSignature => write!(f, "bad signature"),
            RejectReason::Expired => write!(f, "expired"),
            RejectReason::Revoked => write!(f, "revoked"),
            RejectReason::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Linearity fault classes detected by the static verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearityFault {
    /// Handle used before any node produced it
    Dangling,
    /// Handle used after a consuming operation
    UseAfterFree,
    /// Handle consumed twice on a single reachable path
    DoubleConsume,
    /// Second producer for an already-introduced handle
    ReDefinition,
    /// Handle still live at graph end with no consumer
    Leak,
}

impl std::fmt::Display for LinearityFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinearityFault::Dangling => write!(f, "dangling"),
            LinearityFault::UseAfterFree => write!(f, "use-after-free"),
            LinearityFault::DoubleConsume => write!(f, "double-consume"),
            LinearityFault::ReDefinition => write!(f, "re-definition"),
            LinearityFault::Leak => write!(f, "leak"),
        }
    }
}

/// Rule tags for admission rejections, one per verifier stage family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationRule {
    /// Dependency relation admits no topological extension
    Cyclic,
    /// Virtual-qubit or channel linearity violation
    Linearity(LinearityFault),
    /// Node capabilities not covered by the submitting token, or under-declared
    CapabilityCoverage,
    /// Guard references an event outside the node's transitive dependencies
    GuardOutOfScope,
    /// Opcode not in the catalogue
    UnknownOp,
    /// Opcode arguments missing or ill-typed
    MalformedArgs,
    /// Two-qubit operation crosses tenants without naming a covering channel
    FirewallIntent,
}

impl std::fmt::Display for VerificationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationRule::Cyclic => write!(f, "cyclic"),
            VerificationRule::Linearity(fault) => write!(f, "linearity/{fault}"),
            VerificationRule::CapabilityCoverage => write!(f, "capability-coverage"),
            VerificationRule::GuardOutOfScope => write!(f, "guard-out-of-scope"),
            VerificationRule::UnknownOp => write!(f, "unknown-op"),
            VerificationRule::MalformedArgs => write!(f, "malformed-args"),
            VerificationRule::FirewallIntent => write!(f, "firewall-intent"),
        }
    }
}

/// Detailed admission rejection naming the rule violated and the offending node
///
/// Admission errors abort before any state mutation and are reported verbatim;
/// they are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationError {
    /// Which certification rule the graph violated
    pub rule: VerificationRule,
    /// Offending node, when the violation is attributable to one
    pub node_id: Option<String>,
    /// Offending handle id, when the violation concerns a handle
    pub handle: Option<String>,
    /// Human-readable context for operators and audit details
    pub detail: String,
}

impl VerificationError {
    pub fn new(rule: VerificationRule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            node_id: None,
            handle: None,
            detail: detail.into(),
        }
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn on_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rule {}", self.rule)?;
        if let Some(node) = &self.node_id {
            write!(f, " at node '{node}'")?;
        }
        if let Some(handle) = &self.handle {
            write!(f, " on handle '{handle}'")?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Comprehensive error type covering every substrate component and failure mode
///
/// Admission errors surface before execution and leave the session unchanged.
/// Authorization and resource errors during execution fail the current job and
/// trigger UNLOAD. Cleanup itself never propagates errors.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum QvmError {
    /// Static certification failure with rule tag and offending node/handle
    ///
    /// Examples: dependency cycles, use-after-free on a virtual qubit,
    /// capability under-declaration, cross-tenant intent without a channel
    #[error("verification error: {0}")]
    Verification(VerificationError),

    /// Capability token failed verification
    ///
    /// Examples: MAC mismatch, expiry, transitive revocation, use-count exhaustion
    #[error("token rejected: {0}")]
    TokenRejected(RejectReason),

    /// Token verified but does not grant the capabilities the operation requires
    #[error("missing capability: required {required}, granted {granted}")]
    MissingCapability {
        required: CapabilitySet,
        granted: CapabilitySet,
    },

    /// Physical qubit pool cannot satisfy an allocation request
    ///
    /// No partial allocation side effect remains after this error
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// Session quota or rate limit would be exceeded
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Runtime cross-tenant entanglement attempt without a live covering channel
    #[error("firewall violation: {0}")]
    FirewallViolation(String),

    /// Handle id not bound in the current execution context
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Job cancelled cooperatively between node dispatches
    #[error("cancelled")]
    Cancelled,

    /// Job wall-clock deadline or wait deadline elapsed
    #[error("timeout: {0}")]
    Timeout(String),

    /// Session authentication failure at the admission interface
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Unknown session, job, or channel identifier
    #[error("not found: {0}")]
    NotFound(String),

    /// Wire-format parse or canonical encoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid substrate configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invariant violation not expressible in the public taxonomy
    ///
    /// The engine transitions to `Failed` and preserves the offending node id
    /// in the audit log
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for all substrate operations
///
/// This alias provides a consistent error-handling interface across the entire
/// codebase; all public API functions return it.
pub type Result<T> = std::result::Result<T, QvmError>;
