//! # Resource Manager - Physical Qubit Pool and Tenant Reservations
//!
//! Owns the process-wide physical qubit pool and the logical qubit table.
//! Allocation reserves `n × physical_per_logical` physical qubits exclusively
//! for one tenant; physical qubits are never shared concurrently across
//! tenants and are reset to zero before reallocation.
//!
//! All pool state sits behind one mutex with short critical sections; no
//! long-lived work on a logical qubit ever holds the lock across anything but
//! the closure the caller supplies. When a caller also needs the firewall
//! lock, it takes this one first ("resource → firewall") to keep lock order
//! consistent.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::logging::{log_info, LogCategory};
use crate::logical_qubit::{LogicalQubit, QecProfile};
use crate::{QvmError, Result};

/// Read-only telemetry snapshot of the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub logical_qubits_live: usize,
    pub physical_qubits_in_use: usize,
    pub per_tenant_counts: HashMap<String, usize>,
    pub channels_open: usize,
}

struct VqRecord {
    tenant: String,
    physical: Vec<usize>,
    qubit: LogicalQubit,
}

struct PoolState {
    /// Free physical qubit indices
    free: Vec<usize>,
    /// One cell per physical qubit; nonzero while reserved
    physical_bits: Vec<u8>,
    /// Physical indices reserved per tenant
    tenant_allocations: HashMap<String, HashSet<usize>>,
    /// Live logical qubits by virtual qubit id
    vq_table: HashMap<String, VqRecord>,
}

/// Process-wide qubit inventory
pub struct ResourceManager {
    total: usize,
    state: Mutex<PoolState>,
}

impl ResourceManager {
    pub fn new(total_physical_qubits: usize) -> Self {
        Self {
            total: total_physical_qubits,
            state: Mutex::new(PoolState {
                free: (0..total_physical_qubits).rev().collect(),
                physical_bits: vec![0; total_physical_qubits],
                tenant_allocations: HashMap::new(),
                vq_table: HashMap::new(),
            }),
        }
    }

    pub fn total_physical(&self) -> usize {
        self.total
    }

    /// Reserve `n` logical qubits for `tenant` under `profile`
    ///
    /// Returns fresh virtual qubit ids. Fails with `Exhausted` when the pool
    /// cannot satisfy the whole request; a failed allocation leaves no partial
    /// side effect.
    pub fn alloc(&self, tenant: &str, n: usize, profile: &QecProfile) -> Result<Vec<String>> {
        if n == 0 {
            return Err(QvmError::Exhausted("allocation of zero qubits".to_string()));
        }
        let need = n * profile.physical_per_logical;
        let mut state = self.state.lock();
        if state.free.len() < need {
            return Err(QvmError::Exhausted(format!(
                "requested {need} physical qubits, {} free",
                state.free.len()
            )));
        }

        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let mut physical = Vec::with_capacity(profile.physical_per_logical);
            for _ in 0..profile.physical_per_logical {
                let idx = state.free.pop().expect("free-list size checked above");
                debug_assert_eq!(state.physical_bits[idx], 0, "reused qubit not reset");
                state.physical_bits[idx] = 1;
                physical.push(idx);
            }
            let vq_id = format!("vq-{}", Uuid::new_v4());
            state
                .tenant_allocations
                .entry(tenant.to_string())
                .or_default()
                .extend(physical.iter().copied());
            state.vq_table.insert(
                vq_id.clone(),
                VqRecord {
                    tenant: tenant.to_string(),
                    physical,
                    qubit: LogicalQubit::new(vq_id.clone(), profile.clone()),
                },
            );
            ids.push(vq_id);
        }
        drop(state);

        log_info(
            LogCategory::Resource,
            &format!("allocated {n} logical qubits ({need} physical) for tenant '{tenant}'"),
        );
        Ok(ids)
    }

    /// Return the listed qubits to the pool, dropping their logical state
    ///
    /// Physical qubits are zeroed before rejoining the free list.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidHandle` on the first id with no live record;
    /// earlier ids in the list are still freed.
    pub fn free(&self, vq_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        for id in vq_ids {
            let record = state
                .vq_table
                .remove(id)
                .ok_or_else(|| QvmError::InvalidHandle(format!("no live qubit '{id}'")))?;
            if let Some(allocated) = state.tenant_allocations.get_mut(&record.tenant) {
                for idx in &record.physical {
                    allocated.remove(idx);
                }
            }
            for idx in record.physical {
                state.physical_bits[idx] = 0;
                state.free.push(idx);
            }
        }
        Ok(())
    }

    /// Forcibly free every qubit a tenant holds; returns how many were freed
    ///
    /// Used on session termination: the tenant's physical reservation is
    /// zeroed in full.
    pub fn free_tenant(&self, tenant: &str) -> usize {
        let ids: Vec<String> = {
            let state = self.state.lock();
            state
                .vq_table
                .iter()
                .filter(|(_, r)| r.tenant == tenant)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let count = ids.len();
        let _ = self.free(&ids);
        count
    }

    /// Owning tenant of a live virtual qubit
    pub fn owner(&self, vq_id: &str) -> Option<String> {
        self.state
            .lock()
            .vq_table
            .get(vq_id)
            .map(|r| r.tenant.clone())
    }

    /// Live logical qubit count for a tenant
    pub fn live_vqs(&self, tenant: &str) -> usize {
        self.state
            .lock()
            .vq_table
            .values()
            .filter(|r| r.tenant == tenant)
            .count()
    }

    /// Total live logical qubit count
    pub fn live_total(&self) -> usize {
        self.state.lock().vq_table.len()
    }

    /// Run a closure against one live logical qubit
    pub fn with_qubit<R>(
        &self,
        vq_id: &str,
        f: impl FnOnce(&mut LogicalQubit) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock();
        let record = state
            .vq_table
            .get_mut(vq_id)
            .ok_or_else(|| QvmError::InvalidHandle(format!("no live qubit '{vq_id}'")))?;
        Ok(f(&mut record.qubit))
    }

    /// Run a closure against two distinct live logical qubits
    pub fn with_pair<R>(
        &self,
        a: &str,
        b: &str,
        f: impl FnOnce(&mut LogicalQubit, &mut LogicalQubit) -> R,
    ) -> Result<R> {
        if a == b {
            return Err(QvmError::InvalidHandle(format!(
                "two-qubit operation on a single qubit '{a}'"
            )));
        }
        let mut state = self.state.lock();
        // Take one record out so we can hold two mutable borrows
        let mut first = state
            .vq_table
            .remove(a)
            .ok_or_else(|| QvmError::InvalidHandle(format!("no live qubit '{a}'")))?;
        let result = match state.vq_table.get_mut(b) {
            Some(second) => Ok(f(&mut first.qubit, &mut second.qubit)),
            None => Err(QvmError::InvalidHandle(format!("no live qubit '{b}'"))),
        };
        state.vq_table.insert(a.to_string(), first);
        result
    }

    /// Clone of the logical qubit state, for diagnostics and tests
    pub fn qubit_state(&self, vq_id: &str) -> Result<LogicalQubit> {
        self.with_qubit(vq_id, |q| q.clone())
    }

    /// Physical indices currently reserved by a tenant
    pub fn tenant_physical(&self, tenant: &str) -> HashSet<usize> {
        self.state
            .lock()
            .tenant_allocations
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    /// Read-only telemetry snapshot
    pub fn snapshot(&self, channels_open: usize) -> ResourceSnapshot {
        let state = self.state.lock();
        let mut per_tenant = HashMap::new();
        for record in state.vq_table.values() {
            *per_tenant.entry(record.tenant.clone()).or_insert(0) += 1;
        }
        ResourceSnapshot {
            logical_qubits_live: state.vq_table.len(),
            physical_qubits_in_use: self.total - state.free.len(),
            per_tenant_counts: per_tenant,
            channels_open,
        }
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot(0);
        f.debug_struct("ResourceManager")
            .field("total", &self.total)
            .field("live", &snapshot.logical_qubits_live)
            .field("snapshot", &json!(snapshot))
            .finish()
    }
}
