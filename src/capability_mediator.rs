//! # Capability Token & Mediator - Unforgeable Operation Gating
//!
//! Issues, verifies, attenuates, and revokes capability tokens, and mediates
//! every privileged operation against them. A token is a signed record binding
//! a tenant to a capability set, an expiry, and a use-count ceiling; the
//! signature is an HMAC-SHA-256 over the canonical encoding of all prior
//! fields under the mediator's 32-byte secret key.
//!
//! ## 🔐 Token Lifecycle
//!
//! - **Issue**: fresh token, zero uses, empty parent, signature over all fields
//! - **Attenuate**: mint a child with narrower capabilities, shorter expiry,
//!   and a smaller use ceiling; the child chains to its parent by id
//! - **Revoke**: add an id to the revoked set; verification fails for that id
//!   and, transitively, for every descendant along the parent chain
//! - **Check**: atomic verify → capability coverage → use-count increment;
//!   denials emit an `AccessDenied`-class audit event
//!
//! ## Failure Semantics
//!
//! Verification errors are always fatal to the current operation and never
//! retried automatically. Use-count exhaustion is a hard error, not a graceful
//! degradation.
//!
//! MAC comparison is constant-time; no verification path branches on secret
//! material.

use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::audit_log::{AuditEventKind, AuditLog};
use crate::graph_model::{Capability, CapabilitySet, OpCode};
use crate::logging::{log_security, LogCategory};
use crate::{QvmError, RejectReason, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of the mediator's secret MAC key in bytes
pub const MAC_KEY_LEN: usize = 32;

/// Secret MAC key, zeroed on drop
#[derive(Zeroize, ZeroizeOnDrop)]
struct MacKey([u8; MAC_KEY_LEN]);

/// Signed, revocable, attenuable, rate-limited container of capabilities
///
/// Tokens are plain values; all mutable bookkeeping (use counts, revocation,
/// parent chains) lives inside the mediator. `uses_so_far` records the count
/// at signing time and is zero for freshly issued tokens; the mediator's
/// counter is authoritative afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// Unforgeable token id
    pub id: String,
    /// Principal this token is bound to
    pub tenant: String,
    /// Capability kinds the token grants
    pub caps: CapabilitySet,
    /// Unix seconds at issuance
    pub issued_at: i64,
    /// Unix seconds after which verification fails with `Expired`
    pub expires_at: i64,
    /// Hard ceiling on mediated check calls
    pub max_uses: u64,
    /// Use count at signing time
    pub uses_so_far: u64,
    /// Id of the token this one was attenuated from; empty for roots
    pub parent_id: String,
    /// HMAC-SHA-256 over the canonical encoding of all prior fields
    pub signature: Vec<u8>,
}

impl CapabilityToken {
    /// Canonical byte encoding of every field the signature binds
    ///
    /// Fields are length-prefixed so no two distinct records share an
    /// encoding.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(b"qvm-cap-token-v1");
        for field in [&self.id, &self.tenant, &self.parent_id] {
            buf.put_u32(field.len() as u32);
            buf.put_slice(field.as_bytes());
        }
        buf.put_u8(self.caps.bits());
        buf.put_i64(self.issued_at);
        buf.put_i64(self.expires_at);
        buf.put_u64(self.max_uses);
        buf.put_u64(self.uses_so_far);
        buf.to_vec()
    }
}

#[derive(Default)]
struct MediatorState {
    /// Revoked token ids; membership also poisons every descendant
    revoked: HashSet<String>,
    /// Authoritative use counters, keyed by token id
    uses: HashMap<String, u64>,
    /// Parent chain links recorded at issue/attenuate time
    parents: HashMap<String, String>,
    /// Per-tenant (minute, count) windows for the optional rate limit
    rate_windows: HashMap<String, (i64, u32)>,
}

/// The capability mediator: token authority and operation gate
///
/// `check` is atomic: verification, coverage, and the use-count increment all
/// happen under one internal lock, so concurrent engines cannot overspend a
/// token's use budget.
pub struct TokenMediator {
    key: MacKey,
    state: Mutex<MediatorState>,
    audit: Arc<AuditLog>,
    /// Optional ceiling on mediated checks per tenant per minute
    rate_limit_per_min: Option<u32>,
}

impl TokenMediator {
    /// Create a mediator with a freshly generated random key
    pub fn new(audit: Arc<AuditLog>) -> Self {
        let mut key = [0u8; MAC_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self::with_key(key, audit)
    }

    /// Create a mediator over an explicit key (deterministic deployments)
    pub fn with_key(key: [u8; MAC_KEY_LEN], audit: Arc<AuditLog>) -> Self {
        Self {
            key: MacKey(key),
            state: Mutex::new(MediatorState::default()),
            audit,
            rate_limit_per_min: None,
        }
    }

    /// Enable the per-tenant rate limit on `check` calls
    pub fn with_rate_limit(mut self, checks_per_minute: u32) -> Self {
        self.rate_limit_per_min = Some(checks_per_minute);
        self
    }

    fn sign(&self, token: &CapabilityToken) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key.0)
            .expect("HMAC accepts a 32-byte key");
        mac.update(&token.canonical_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Issue a fresh root token for `tenant`
    pub fn issue(
        &self,
        tenant: &str,
        caps: &[Capability],
        ttl_secs: i64,
        max_uses: u64,
    ) -> CapabilityToken {
        let now = chrono::Utc::now().timestamp();
        let mut token = CapabilityToken {
            id: Uuid::new_v4().to_string(),
            tenant: tenant.to_string(),
            caps: CapabilitySet::from_caps(caps),
            issued_at: now,
            expires_at: now + ttl_secs,
            max_uses,
            uses_so_far: 0,
            parent_id: String::new(),
            signature: Vec::new(),
        };
        token.signature = self.sign(&token);

        let mut state = self.state.lock();
        state.uses.insert(token.id.clone(), 0);
        state.parents.insert(token.id.clone(), String::new());
        drop(state);

        log_security(
            "capability token issued",
            json!({"token": token.id, "tenant": tenant, "caps": token.caps.to_string()}),
        );
        token
    }

    /// Verify a token: signature, expiry, revocation chain, use ceiling
    ///
    /// # Errors
    ///
    /// Fails with `TokenRejected(BadSignature | Expired | Revoked | Exhausted)`
    /// in that check order.
    pub fn verify(&self, token: &CapabilityToken) -> Result<()> {
        let state = self.state.lock();
        self.verify_locked(token, &state)
    }

    fn verify_locked(&self, token: &CapabilityToken, state: &MediatorState) -> Result<()> {
        let mut mac = HmacSha256::new_from_slice(&self.key.0)
            .expect("HMAC accepts a 32-byte key");
        mac.update(&token.canonical_bytes());
        if mac.verify_slice(&token.signature).is_err() {
            return Err(QvmError::TokenRejected(RejectReason::BadSignature));
        }

        if chrono::Utc::now().timestamp() > token.expires_at {
            return Err(QvmError::TokenRejected(RejectReason::Expired));
        }

        // Revocation is transitive along the parent chain. The first hop comes
        // from the token itself so revocation of an unregistered ancestor
        // still bites.
        let mut cursor = token.id.clone();
        let mut next_fallback = Some(token.parent_id.clone());
        loop {
            if state.revoked.contains(&cursor) {
                return Err(QvmError::TokenRejected(RejectReason::Revoked));
            }
            let next = state
                .parents
                .get(&cursor)
                .cloned()
                .or_else(|| next_fallback.take());
            match next {
                Some(parent) if !parent.is_empty() => cursor = parent,
                _ => break,
            }
        }

        let used = state.uses.get(&token.id).copied().unwrap_or(token.uses_so_far);
        if used >= token.max_uses {
            return Err(QvmError::TokenRejected(RejectReason::Exhausted));
        }
        Ok(())
    }

    /// Mint a narrower child of `parent`
    ///
    /// The child's capabilities must be a subset of the parent's, its expiry
    /// must not exceed the parent's, and its use ceiling must not exceed the
    /// parent's. Revoking the parent later poisons the child.
    ///
    /// # Errors
    ///
    /// Fails when the parent does not verify, or when any bound would widen.
    pub fn attenuate(
        &self,
        parent: &CapabilityToken,
        caps: &[Capability],
        ttl_secs: i64,
        max_uses: u64,
    ) -> Result<CapabilityToken> {
        self.verify(parent)?;

        let child_caps = CapabilitySet::from_caps(caps);
        if !parent.caps.contains(child_caps) {
            return Err(QvmError::Configuration(format!(
                "attenuation must narrow capabilities: {child_caps} is not a subset of {}",
                parent.caps
            )));
        }
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + ttl_secs;
        if expires_at > parent.expires_at {
            return Err(QvmError::Configuration(
                "attenuation must not extend the parent's expiry".to_string(),
            ));
        }
        if max_uses > parent.max_uses {
            return Err(QvmError::Configuration(
                "attenuation must not raise the parent's use ceiling".to_string(),
            ));
        }

        let mut child = CapabilityToken {
            id: Uuid::new_v4().to_string(),
            tenant: parent.tenant.clone(),
            caps: child_caps,
            issued_at: now,
            expires_at,
            max_uses,
            uses_so_far: 0,
            parent_id: parent.id.clone(),
            signature: Vec::new(),
        };
        child.signature = self.sign(&child);

        let mut state = self.state.lock();
        state.uses.insert(child.id.clone(), 0);
        state.parents.insert(child.id.clone(), parent.id.clone());
        drop(state);

        log_security(
            "capability token attenuated",
            json!({"child": child.id, "parent": parent.id, "caps": child.caps.to_string()}),
        );
        Ok(child)
    }

    /// Revoke a token id; descendants fail verification from now on
    pub fn revoke(&self, token_id: &str) {
        self.state.lock().revoked.insert(token_id.to_string());
        log_security("capability token revoked", json!({"token": token_id}));
    }

    /// Mediate one operation: verify, cover, and spend one use atomically
    ///
    /// # Errors
    ///
    /// Surfaces `TokenRejected` on verification failure, `MissingCapability`
    /// when the token does not cover the opcode's requirements, and
    /// `QuotaExceeded` when the tenant's check rate limit trips. Every denial
    /// is written to the audit log.
    pub fn check(&self, token: &CapabilityToken, op: OpCode) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(limit) = self.rate_limit_per_min {
            let minute = chrono::Utc::now().timestamp() / 60;
            let window = state
                .rate_windows
                .entry(token.tenant.clone())
                .or_insert((minute, 0));
            if window.0 != minute {
                *window = (minute, 0);
            }
            if window.1 >= limit {
                drop(state);
                self.audit_denied(token, op, "rate limit exceeded");
                return Err(QvmError::QuotaExceeded(format!(
                    "tenant '{}' exceeded {limit} capability checks per minute",
                    token.tenant
                )));
            }
            window.1 += 1;
        }

        if let Err(err) = self.verify_locked(token, &state) {
            drop(state);
            self.audit_denied(token, op, &err.to_string());
            return Err(err);
        }

        let required = op.required_caps();
        if !token.caps.contains(required) {
            drop(state);
            self.audit_denied(token, op, "missing capability");
            return Err(QvmError::MissingCapability {
                required,
                granted: token.caps,
            });
        }

        *state.uses.entry(token.id.clone()).or_insert(token.uses_so_far) += 1;
        drop(state);

        self.audit.append(
            AuditEventKind::CapabilityAllowed,
            &token.tenant,
            vec![token.id.clone()],
            json!({"op": op.as_str()}),
        );
        Ok(())
    }

    fn audit_denied(&self, token: &CapabilityToken, op: OpCode, reason: &str) {
        self.audit.append(
            AuditEventKind::CapabilityDenied,
            &token.tenant,
            vec![token.id.clone()],
            json!({"op": op.as_str(), "reason": reason}),
        );
        crate::logging::log_warn(
            LogCategory::Capability,
            &format!("access denied for op {op}: {reason}"),
        );
    }

    /// Mediated uses spent so far on a token id
    pub fn uses_of(&self, token_id: &str) -> u64 {
        self.state.lock().uses.get(token_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mediator() -> TokenMediator {
        TokenMediator::with_key([7u8; MAC_KEY_LEN], Arc::new(AuditLog::new()))
    }

    #[test]
    fn test_issue_and_verify() {
        let mediator = mediator();
        let token = mediator.issue("tenant-a", &[Capability::Alloc], 60, 10);
        assert!(mediator.verify(&token).is_ok());
        assert_eq!(token.uses_so_far, 0);
        assert!(token.parent_id.is_empty());
    }

    #[test]
    fn test_tampered_token_fails_with_bad_signature() {
        let mediator = mediator();
        let mut token = mediator.issue("tenant-a", &[Capability::Alloc], 60, 10);
        token.caps = CapabilitySet::all(); // escalate without re-signing
        assert!(matches!(
            mediator.verify(&token),
            Err(QvmError::TokenRejected(RejectReason::BadSignature))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let mediator = mediator();
        let token = mediator.issue("tenant-a", &[Capability::Alloc], -1, 10);
        assert!(matches!(
            mediator.verify(&token),
            Err(QvmError::TokenRejected(RejectReason::Expired))
        ));
    }

    #[test]
    fn test_use_count_exhaustion_is_hard() {
        let mediator = mediator();
        let token = mediator.issue("tenant-a", &[Capability::Alloc], 60, 2);
        assert!(mediator.check(&token, OpCode::AllocLq).is_ok());
        assert!(mediator.check(&token, OpCode::FreeLq).is_ok());
        assert!(matches!(
            mediator.check(&token, OpCode::AllocLq),
            Err(QvmError::TokenRejected(RejectReason::Exhausted))
        ));
        assert_eq!(mediator.uses_of(&token.id), 2);
    }

    #[test]
    fn test_attenuation_round_trip() {
        let mediator = mediator();
        let parent = mediator.issue(
            "tenant-a",
            &[Capability::Alloc, Capability::Compute, Capability::Measure],
            600,
            100,
        );
        let child = mediator
            .attenuate(&parent, &[Capability::Alloc], 60, 10)
            .unwrap();

        assert!(mediator.verify(&child).is_ok());
        assert_eq!(child.caps, CapabilitySet::ALLOC);
        assert_eq!(child.max_uses, 10);
        assert_eq!(child.parent_id, parent.id);
    }

    #[test]
    fn test_attenuation_cannot_widen() {
        let mediator = mediator();
        let parent = mediator.issue("tenant-a", &[Capability::Alloc], 600, 100);

        assert!(mediator
            .attenuate(&parent, &[Capability::Alloc, Capability::Admin], 60, 10)
            .is_err());
        assert!(mediator
            .attenuate(&parent, &[Capability::Alloc], 60, 1_000)
            .is_err());
        assert!(mediator
            .attenuate(&parent, &[Capability::Alloc], 6_000, 10)
            .is_err());
    }

    #[test]
    fn test_revocation_cascades_to_descendants() {
        let mediator = mediator();
        let t0 = mediator.issue("tenant-a", &[Capability::Alloc], 600, 100);
        let t1 = mediator.attenuate(&t0, &[Capability::Alloc], 60, 10).unwrap();
        let t2 = mediator.attenuate(&t1, &[Capability::Alloc], 30, 5).unwrap();

        mediator.revoke(&t0.id);
        for token in [&t0, &t1, &t2] {
            assert!(matches!(
                mediator.verify(token),
                Err(QvmError::TokenRejected(RejectReason::Revoked))
            ));
        }
    }

    #[test]
    fn test_check_denies_missing_capability_and_audits() {
        let audit = Arc::new(AuditLog::new());
        let mediator = TokenMediator::with_key([7u8; MAC_KEY_LEN], audit.clone());
        let token = mediator.issue("tenant-a", &[Capability::Alloc], 60, 10);

        let err = mediator.check(&token, OpCode::MeasureZ).unwrap_err();
        match err {
            QvmError::MissingCapability { required, granted } => {
                assert_eq!(required, CapabilitySet::MEASURE);
                assert_eq!(granted, CapabilitySet::ALLOC);
            }
            other => panic!("expected missing capability, got {other}"),
        }

        let denials = audit.query_by_kind(AuditEventKind::CapabilityDenied);
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].tenant, "tenant-a");
        // The denied check spent no use
        assert_eq!(mediator.uses_of(&token.id), 0);
    }

    #[test]
    fn test_rate_limit_bounds_check_throughput() {
        let mediator = TokenMediator::with_key([7u8; MAC_KEY_LEN], Arc::new(AuditLog::new()))
            .with_rate_limit(3);
        let token = mediator.issue("tenant-a", &[Capability::Compute], 60, 100);

        for _ in 0..3 {
            assert!(mediator.check(&token, OpCode::ApplyH).is_ok());
        }
        assert!(matches!(
            mediator.check(&token, OpCode::ApplyH),
            Err(QvmError::QuotaExceeded(_))
        ));
    }
}
