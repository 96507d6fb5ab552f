//! # Entanglement Firewall - Cross-Tenant Isolation Policy
//!
//! Maintains the qubit→tenant ownership view (read from the resource manager)
//! and an undirected entanglement-relation graph over live virtual qubits,
//! plus the registry of inter-tenant entanglement channels.
//!
//! For every two-qubit unitary or measurement on qubits `a` and `b`:
//!
//! 1. Same owner: record the edge `(a, b)` if absent, allow.
//! 2. Different owners: require a live channel whose tenant pair equals
//!    `{owner(a), owner(b)}`; refuse with `FirewallViolation` otherwise.
//!
//! Measurement and free prune the affected qubit's incident edges — the
//! measured state is classical afterwards. Both verdicts are written to the
//! audit log.
//!
//! The entanglement graph is an adjacency set over handle ids; handles are
//! ids, not owning references, so no ownership cycles exist.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::audit_log::{AuditEventKind, AuditLog};
use crate::logging::{log_info, log_warn, LogCategory};
use crate::resource_manager::ResourceManager;
use crate::{QvmError, Result};

/// Lifecycle state of an entanglement channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Open,
    Closed,
}

/// One inter-tenant entanglement channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    /// The two tenants this channel links
    pub tenants: (String, String),
    /// Job that opened the channel; session-end cleanup keys off this
    pub opened_by_job: String,
    pub opened_at: i64,
    pub state: ChannelState,
    /// Producer-supplied channel options; not interpreted by the core
    pub options: Map<String, Value>,
}

impl ChannelRecord {
    fn covers(&self, a: &str, b: &str) -> bool {
        let (ta, tb) = (&self.tenants.0, &self.tenants.1);
        (ta == a && tb == b) || (ta == b && tb == a)
    }
}

struct FirewallState {
    /// Undirected entanglement relation over live virtual qubits
    entangled: HashMap<String, HashSet<String>>,
    channels: HashMap<String, ChannelRecord>,
    /// granting tenant → peers it has agreed to link with
    link_consents: HashMap<String, HashSet<String>>,
}

/// The entanglement firewall
///
/// Shares lock discipline with the resource manager: ownership queries go to
/// the resource lock first and complete before the firewall lock is taken, so
/// the "resource → firewall" order is never inverted.
pub struct EntanglementFirewall {
    resources: Arc<ResourceManager>,
    audit: Arc<AuditLog>,
    state: Mutex<FirewallState>,
}

impl EntanglementFirewall {
    pub fn new(resources: Arc<ResourceManager>, audit: Arc<AuditLog>) -> Self {
        Self {
            resources,
            audit,
            state: Mutex::new(FirewallState {
                entangled: HashMap::new(),
                channels: HashMap::new(),
                link_consents: HashMap::new(),
            }),
        }
    }

    /// Authorize a two-qubit interaction and record the entanglement edge
    ///
    /// # Errors
    ///
    /// Fails with `InvalidHandle` when either qubit is not live, and with
    /// `FirewallViolation` when the owners differ and no live channel covers
    /// the tenant pair. Every verdict lands in the audit log.
    pub fn authorize_interaction(
        &self,
        a: &str,
        b: &str,
        channel_hint: Option<&str>,
        job_id: &str,
    ) -> Result<()> {
        let owner_a = self
            .resources
            .owner(a)
            .ok_or_else(|| QvmError::InvalidHandle(format!("no live qubit '{a}'")))?;
        let owner_b = self
            .resources
            .owner(b)
            .ok_or_else(|| QvmError::InvalidHandle(format!("no live qubit '{b}'")))?;

        let mut state = self.state.lock();
        if owner_a != owner_b {
            let covered = match channel_hint {
                Some(chan) => state
                    .channels
                    .get(chan)
                    .is_some_and(|c| c.state == ChannelState::Open && c.covers(&owner_a, &owner_b)),
                None => false,
            };
            if !covered {
                drop(state);
                self.audit.append(
                    AuditEventKind::FirewallDenied,
                    &owner_a,
                    vec![a.to_string(), b.to_string()],
                    json!({"peer_tenant": owner_b, "job": job_id, "channel": channel_hint}),
                );
                log_warn(
                    LogCategory::Firewall,
                    &format!("refused entanglement between tenants '{owner_a}' and '{owner_b}'"),
                );
                return Err(QvmError::FirewallViolation(format!(
                    "qubits '{a}' ({owner_a}) and '{b}' ({owner_b}) have no live channel"
                )));
            }
        }

        state.entangled.entry(a.to_string()).or_default().insert(b.to_string());
        state.entangled.entry(b.to_string()).or_default().insert(a.to_string());
        drop(state);

        self.audit.append(
            AuditEventKind::FirewallAllowed,
            &owner_a,
            vec![a.to_string(), b.to_string()],
            json!({"peer_tenant": owner_b, "job": job_id}),
        );
        Ok(())
    }

    /// Diagnostic predicate: could `a` and `b` legally entangle right now?
    pub fn may_entangle(&self, a: &str, b: &str) -> bool {
        let (Some(owner_a), Some(owner_b)) = (self.resources.owner(a), self.resources.owner(b))
        else {
            return false;
        };
        if owner_a == owner_b {
            return true;
        }
        self.state
            .lock()
            .channels
            .values()
            .any(|c| c.state == ChannelState::Open && c.covers(&owner_a, &owner_b))
    }

    /// Prune a qubit from the entanglement relation (measured or freed)
    pub fn drop_vq(&self, vq_id: &str) {
        let mut state = self.state.lock();
        if let Some(peers) = state.entangled.remove(vq_id) {
            for peer in peers {
                if let Some(set) = state.entangled.get_mut(&peer) {
                    set.remove(vq_id);
                }
            }
        }
    }

    /// Current entanglement partners of a live qubit
    pub fn entangled_with(&self, vq_id: &str) -> HashSet<String> {
        self.state
            .lock()
            .entangled
            .get(vq_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a channel between two tenants
    ///
    /// # Errors
    ///
    /// Fails when a live channel already claims the id.
    pub fn open_channel(
        &self,
        id: &str,
        tenant_a: &str,
        tenant_b: &str,
        job_id: &str,
        options: Map<String, Value>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .channels
            .get(id)
            .is_some_and(|c| c.state == ChannelState::Open)
        {
            return Err(QvmError::FirewallViolation(format!(
                "channel '{id}' is already open"
            )));
        }
        state.channels.insert(
            id.to_string(),
            ChannelRecord {
                id: id.to_string(),
                tenants: (tenant_a.to_string(), tenant_b.to_string()),
                opened_by_job: job_id.to_string(),
                opened_at: chrono::Utc::now().timestamp(),
                state: ChannelState::Open,
                options,
            },
        );
        drop(state);
        log_info(
            LogCategory::Firewall,
            &format!("channel '{id}' opened between '{tenant_a}' and '{tenant_b}'"),
        );
        Ok(())
    }

    /// Close a live channel
    ///
    /// # Errors
    ///
    /// Fails with `InvalidHandle` when the channel is unknown or already
    /// closed.
    pub fn close_channel(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.channels.get_mut(id) {
            Some(record) if record.state == ChannelState::Open => {
                record.state = ChannelState::Closed;
                Ok(())
            }
            Some(_) => Err(QvmError::InvalidHandle(format!(
                "channel '{id}' is already closed"
            ))),
            None => Err(QvmError::InvalidHandle(format!("no channel '{id}'"))),
        }
    }

    pub fn channel(&self, id: &str) -> Option<ChannelRecord> {
        self.state.lock().channels.get(id).cloned()
    }

    pub fn channels_open(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .filter(|c| c.state == ChannelState::Open)
            .count()
    }

    /// Live channel count involving a tenant (quota accounting)
    pub fn open_channels_for_tenant(&self, tenant: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .filter(|c| {
                c.state == ChannelState::Open
                    && (c.tenants.0 == tenant || c.tenants.1 == tenant)
            })
            .count()
    }

    /// Is any live channel covering this tenant pair?
    pub fn live_channel_between(&self, tenant_a: &str, tenant_b: &str) -> bool {
        self.state
            .lock()
            .channels
            .values()
            .any(|c| c.state == ChannelState::Open && c.covers(tenant_a, tenant_b))
    }

    /// Record that `granting_tenant` agrees to channels with `peer_tenant`
    ///
    /// Channel establishment is mutual: `OPEN_CHAN` submitted by one tenant
    /// only succeeds once the other side has consented. The service gates this
    /// call on a verified `CAP_LINK` token of the granting tenant.
    pub fn record_link_consent(&self, granting_tenant: &str, peer_tenant: &str) {
        self.state
            .lock()
            .link_consents
            .entry(granting_tenant.to_string())
            .or_default()
            .insert(peer_tenant.to_string());
        log_info(
            LogCategory::Firewall,
            &format!("tenant '{granting_tenant}' consented to link with '{peer_tenant}'"),
        );
    }

    /// Has `granting_tenant` consented to channels with `peer_tenant`?
    pub fn has_link_consent(&self, granting_tenant: &str, peer_tenant: &str) -> bool {
        self.state
            .lock()
            .link_consents
            .get(granting_tenant)
            .is_some_and(|peers| peers.contains(peer_tenant))
    }

    /// Close every channel a job opened and left open (UNLOAD path)
    pub fn close_channels_for_job(&self, job_id: &str) -> usize {
        let mut state = self.state.lock();
        let mut closed = 0;
        for record in state.channels.values_mut() {
            if record.state == ChannelState::Open && record.opened_by_job == job_id {
                record.state = ChannelState::Closed;
                closed += 1;
            }
        }
        closed
    }

    /// Close every channel involving a tenant (session termination)
    pub fn close_tenant_channels(&self, tenant: &str) -> usize {
        let mut state = self.state.lock();
        let mut closed = 0;
        for record in state.channels.values_mut() {
            if record.state == ChannelState::Open
                && (record.tenants.0 == tenant || record.tenants.1 == tenant)
            {
                record.state = ChannelState::Closed;
                closed += 1;
            }
        }
        closed
    }
}
