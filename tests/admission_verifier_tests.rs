use qvm_substrate::audit_log::AuditEventKind;
use qvm_substrate::graph_model::{Capability, ParseMode, ProgramGraph};
use qvm_substrate::static_verifier::{certify, VerifierOptions};
use qvm_substrate::*;

/// Admission-path integration tests
///
/// These suites drive graphs through the full service facade and assert that
/// inadmissible programs are rejected with the documented rule tags before
/// any execution side effect occurs.

fn bell_graph_json(version: &str) -> String {
    format!(
        r#"{{
        "version": "{version}",
        "nodes": [
            {{"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"],
             "args": {{"n": 2}}, "caps": ["CAP_ALLOC"], "deps": []}},
            {{"id": "h", "op": "APPLY_H", "vqs": ["q0"],
             "caps": ["CAP_COMPUTE"], "deps": ["alloc"]}},
            {{"id": "cx", "op": "APPLY_CNOT", "vqs": ["q0", "q1"],
             "caps": ["CAP_COMPUTE"], "deps": ["h"]}},
            {{"id": "m0", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["m0_bit"],
             "caps": ["CAP_MEASURE"], "deps": ["cx"]}},
            {{"id": "m1", "op": "MEASURE_Z", "vqs": ["q1"], "produces": ["m1_bit"],
             "caps": ["CAP_MEASURE"], "deps": ["cx"]}},
            {{"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1"],
             "caps": ["CAP_ALLOC"], "deps": ["m0", "m1"]}}
        ]
    }}"#
    )
}

fn bell_graph() -> ProgramGraph {
    ProgramGraph::from_json(&bell_graph_json("0.1"), ParseMode::Strict).unwrap()
}

#[tokio::test]
async fn test_missing_capability_rejects_admission_naming_the_node() -> Result<()> {
    println!("🧪 Testing Admission Rejection on Missing Capability");

    let service = create_test_service();
    // Token deliberately omits CAP_MEASURE
    let token = service.mediator().issue(
        "tenant-a",
        &[Capability::Alloc, Capability::Compute],
        600,
        1_000,
    );
    let session = service.open_session("tenant-a", &token)?;

    let err = service
        .submit(session.id(), bell_graph(), token)
        .await
        .unwrap_err();
    match err {
        QvmError::Verification(v) => {
            assert_eq!(v.rule, VerificationRule::CapabilityCoverage);
            assert_eq!(v.node_id.as_deref(), Some("m0"));
            println!("✅ Rejected with rule {} at node m0", v.rule);
        }
        other => panic!("expected verification error, got {other}"),
    }

    // No execution happened: admission errors abort before state mutation
    let audit = service.audit();
    assert_eq!(audit.query_by_kind(AuditEventKind::OperationExecuted).len(), 0);
    assert_eq!(audit.query_by_kind(AuditEventKind::AdmissionRejected).len(), 1);
    assert_eq!(service.resource_snapshot().logical_qubits_live, 0);
    println!("✅ No execution side effects recorded");
    Ok(())
}

#[tokio::test]
async fn test_double_free_is_rejected_at_admission() -> Result<()> {
    println!("🧪 Testing Double-Free Rejection");

    let service = create_test_service();
    let token = service.mediator().issue(
        "tenant-a",
        &[Capability::Alloc, Capability::Compute, Capability::Measure],
        600,
        1_000,
    );
    let session = service.open_session("tenant-a", &token)?;

    let graph = ProgramGraph::from_json(
        r#"{"version": "0.1", "nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0"],
             "args": {"n": 1}, "caps": ["CAP_ALLOC"], "deps": []},
            {"id": "f1", "op": "FREE_LQ", "vqs": ["q0"],
             "caps": ["CAP_ALLOC"], "deps": ["alloc"]},
            {"id": "f2", "op": "FREE_LQ", "vqs": ["q0"],
             "caps": ["CAP_ALLOC"], "deps": ["f1"]}
        ]}"#,
        ParseMode::Strict,
    )?;

    let err = service.submit(session.id(), graph, token).await.unwrap_err();
    match err {
        QvmError::Verification(v) => {
            assert_eq!(
                v.rule,
                VerificationRule::Linearity(LinearityFault::UseAfterFree)
            );
            assert_eq!(v.node_id.as_deref(), Some("f2"));
            println!("✅ Second free named: {v}");
        }
        other => panic!("expected verification error, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_forged_handle_is_firewall_intent_with_no_execution_audit() -> Result<()> {
    println!("🧪 Testing Cross-Tenant Forged Handle Rejection");

    let service = create_test_service();
    let token = service.mediator().issue(
        "tenant-a",
        &[Capability::Alloc, Capability::Compute, Capability::Measure],
        600,
        1_000,
    );
    let session = service.open_session("tenant-a", &token)?;

    // A second tenant exists with its own allocation; tenant-a's graph tries
    // to reach one of its qubits by forging a handle string
    let peer_token = service
        .mediator()
        .issue("tenant-b", &[Capability::Alloc], 600, 1_000);
    let _peer_session = service.open_session("tenant-b", &peer_token)?;
    let stolen = service
        .resources()
        .alloc("tenant-b", 1, &Default::default())?;

    let graph = ProgramGraph::from_json(
        &format!(
            r#"{{"version": "0.1", "nodes": [
                {{"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0"],
                 "args": {{"n": 1}}, "caps": ["CAP_ALLOC"], "deps": []}},
                {{"id": "cx", "op": "APPLY_CNOT", "vqs": ["q0", "{}"],
                 "caps": ["CAP_COMPUTE"], "deps": ["alloc"]}},
                {{"id": "m", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["bit"],
                 "caps": ["CAP_MEASURE"], "deps": ["cx"]}}
            ]}}"#,
            stolen[0]
        ),
        ParseMode::Strict,
    )?;

    let err = service.submit(session.id(), graph, token).await.unwrap_err();
    match err {
        QvmError::Verification(v) => {
            assert_eq!(v.rule, VerificationRule::FirewallIntent);
            assert_eq!(v.handle.as_deref(), Some(stolen[0].as_str()));
            println!("✅ Forged handle rejected: {v}");
        }
        other => panic!("expected verification error, got {other}"),
    }

    // Only the admission denial is audited; nothing executed
    let audit = service.audit();
    assert_eq!(audit.query_by_kind(AuditEventKind::OperationExecuted).len(), 0);
    assert_eq!(audit.query_by_kind(AuditEventKind::AdmissionRejected).len(), 1);
    println!("✅ Audit shows only the admission denial");
    Ok(())
}

#[tokio::test]
async fn test_serialize_parse_round_trip_yields_the_same_certificate() -> Result<()> {
    println!("🧪 Testing Wire Round-Trip Certificate Stability");

    let service = create_test_service();
    let token = service.mediator().issue("tenant-a", &Capability::ALL, 600, 1_000);
    let options = VerifierOptions {
        session_tenant: "tenant-a".to_string(),
        advertise_rollback: false,
    };

    let graph = bell_graph();
    let cert_before = certify(&graph, &token, &options)?;

    let reparsed = ProgramGraph::from_json(&graph.to_canonical_json()?, ParseMode::Strict)?;
    let cert_after = certify(&reparsed, &token, &options)?;

    assert_eq!(cert_before.graph_hash, cert_after.graph_hash);
    assert_eq!(cert_before.rev_segments, cert_after.rev_segments);
    assert!(cert_after.matches(&graph));
    println!("✅ Fingerprint and REV segments identical after round trip");
    Ok(())
}

#[tokio::test]
async fn test_strict_and_compatibility_parse_modes() -> Result<()> {
    println!("🧪 Testing Strict vs Compatibility Wire Parsing");

    let doc = r#"{"version": "0.1", "vendor_hint": "fast", "nodes": [
        {"id": "fence", "op": "FENCE_EPOCH", "deps": [], "vendor_weight": 3}
    ]}"#;

    assert!(ProgramGraph::from_json(doc, ParseMode::Strict).is_err());
    let graph = ProgramGraph::from_json(doc, ParseMode::Compatible)?;
    assert_eq!(graph.nodes.len(), 1);
    println!("✅ Strict rejects, compatibility ignores unknown fields");

    let strict_service = QvmService::with_config(SubstrateConfig {
        strict_parsing: true,
        ..SubstrateConfig::default()
    });
    assert_eq!(strict_service.parse_mode(), ParseMode::Strict);
    let relaxed = QvmService::with_config(SubstrateConfig {
        strict_parsing: false,
        ..SubstrateConfig::default()
    });
    assert_eq!(relaxed.parse_mode(), ParseMode::Compatible);
    Ok(())
}

#[tokio::test]
async fn test_unknown_opcode_never_reaches_the_verifier_stages() -> Result<()> {
    println!("🧪 Testing Unknown Opcode Rejection");

    let doc = r#"{"version": "0.1", "nodes": [
        {"id": "alien", "op": "APPLY_CCZ", "vqs": ["a", "b", "c"]}
    ]}"#;
    match ProgramGraph::from_json(doc, ParseMode::Strict).unwrap_err() {
        QvmError::Verification(v) => {
            assert_eq!(v.rule, VerificationRule::UnknownOp);
            assert_eq!(v.node_id.as_deref(), Some("alien"));
            println!("✅ Unknown opcode rejected at parse: {v}");
        }
        other => panic!("expected verification error, got {other}"),
    }
    Ok(())
}
