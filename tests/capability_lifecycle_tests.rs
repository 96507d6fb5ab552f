use qvm_substrate::audit_log::AuditEventKind;
use qvm_substrate::graph_model::{Capability, CapabilitySet, ParseMode, ProgramGraph};
use qvm_substrate::*;

/// Capability token lifecycle tests through the service facade
///
/// Issue, attenuate, revoke, and exhaust tokens and assert the substrate's
/// admission surface honors every bound.

fn alloc_only_graph() -> ProgramGraph {
    ProgramGraph::from_json(
        r#"{"version": "0.1", "nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0"],
             "args": {"n": 1, "profile": {"physical_per_logical": 2}},
             "caps": ["CAP_ALLOC"], "deps": []},
            {"id": "free", "op": "FREE_LQ", "vqs": ["q0"],
             "caps": ["CAP_ALLOC"], "deps": ["alloc"]}
        ]}"#,
        ParseMode::Strict,
    )
    .unwrap()
}

#[tokio::test]
async fn test_revocation_cascade_rejects_attenuated_child_at_submit() -> Result<()> {
    println!("🧪 Testing Revocation Cascade (t0 → t1)");

    let service = create_test_service();
    let t0 = service
        .mediator()
        .issue("tenant-a", &[Capability::Alloc], 600, 1_000);
    let t1 = service
        .mediator()
        .attenuate(&t0, &[Capability::Alloc], 60, 10)?;
    println!("✅ Attenuated child t1 from t0");

    // Session opened while t1 is still healthy
    let session = service.open_session("tenant-a", &t1)?;

    service.mediator().revoke(&t0.id);
    println!("✅ Revoked the root token t0");

    let err = service
        .submit(session.id(), alloc_only_graph(), t1.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QvmError::TokenRejected(RejectReason::Revoked)
    ));
    println!("✅ Submit with t1 rejected: {err}");

    // Rejected before graph verification: no certified admission, and the
    // denial itself is on the record
    let audit = service.audit();
    assert_eq!(audit.query_by_kind(AuditEventKind::AdmissionCertified).len(), 0);
    assert_eq!(audit.query_by_kind(AuditEventKind::AdmissionRejected).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_attenuation_round_trip_law() -> Result<()> {
    println!("🧪 Testing Attenuation Round-Trip Law");

    let service = create_test_service();
    let parent = service.mediator().issue(
        "tenant-a",
        &[Capability::Alloc, Capability::Compute, Capability::Measure],
        3_600,
        1_000,
    );

    let child = service
        .mediator()
        .attenuate(&parent, &[Capability::Alloc], 60, 10)?;
    service.mediator().verify(&child)?;

    // Capabilities are exactly the requested narrowing; max_uses exactly the
    // requested ceiling
    assert_eq!(child.caps, CapabilitySet::ALLOC);
    assert_eq!(child.max_uses, 10);
    assert_eq!(child.tenant, parent.tenant);
    assert_eq!(child.parent_id, parent.id);
    assert!(child.expires_at <= parent.expires_at);
    println!("✅ Child token carries exactly the attenuated bounds");
    Ok(())
}

#[tokio::test]
async fn test_exhausted_token_fails_mid_execution() -> Result<()> {
    println!("🧪 Testing Use-Count Exhaustion During Execution");

    let service = create_test_service();
    // Two mediated checks fit; the graph needs two ops plus session checks
    let token = service
        .mediator()
        .issue("tenant-a", &[Capability::Alloc], 600, 1);
    let session = service.open_session("tenant-a", &token)?;

    let job = service
        .submit(session.id(), alloc_only_graph(), token.clone())
        .await?;
    let result = service.wait(&job, 5_000).await?;

    assert_eq!(result.state, qvm_substrate::execution_engine::JobState::Failed);
    assert!(matches!(
        result.error,
        Some(QvmError::TokenRejected(RejectReason::Exhausted))
    ));
    // The denied check is audited, and UNLOAD still freed the allocation
    assert!(!service
        .audit()
        .query_by_kind(AuditEventKind::CapabilityDenied)
        .is_empty());
    assert_eq!(service.resource_snapshot().logical_qubits_live, 0);
    println!("✅ Exhaustion was a hard failure with clean unload");
    Ok(())
}

#[tokio::test]
async fn test_expired_token_cannot_open_a_session() -> Result<()> {
    println!("🧪 Testing Expired Token Rejection");

    let service = create_test_service();
    let token = service
        .mediator()
        .issue("tenant-a", &[Capability::Alloc], -5, 100);

    let err = service.open_session("tenant-a", &token).unwrap_err();
    assert!(matches!(
        err,
        QvmError::TokenRejected(RejectReason::Expired)
    ));
    println!("✅ Expired token rejected at session open");
    Ok(())
}

#[tokio::test]
async fn test_tampered_signature_is_unforgeable() -> Result<()> {
    println!("🧪 Testing Signature Unforgeability");

    let service = create_test_service();
    let mut token = service
        .mediator()
        .issue("tenant-a", &[Capability::Alloc], 600, 100);

    // Escalate capabilities without the mediator's key
    token.caps = CapabilitySet::all();
    let err = service.open_session("tenant-a", &token).unwrap_err();
    assert!(matches!(
        err,
        QvmError::TokenRejected(RejectReason::BadSignature)
    ));

    // Flipping a signature byte is equally fatal
    let mut flipped = service
        .mediator()
        .issue("tenant-a", &[Capability::Alloc], 600, 100);
    flipped.signature[0] ^= 0x01;
    assert!(matches!(
        service.mediator().verify(&flipped),
        Err(QvmError::TokenRejected(RejectReason::BadSignature))
    ));
    println!("✅ Both forgeries rejected with BadSignature");
    Ok(())
}
