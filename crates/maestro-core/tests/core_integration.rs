#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_core::*;

// ---------------------------------------------------------------------------
// 1. Every error class produces an explicit kind + message object
// ---------------------------------------------------------------------------

#[test]
fn every_error_has_a_report() {
    let errors = vec![
        MaestroError::Validation("missing id".into()),
        MaestroError::Timeout("step build".into()),
        MaestroError::Process("spawn failed".into()),
        MaestroError::LoopPrevention("cooldown".into()),
        MaestroError::PoolExhausted {
            agent: "coder".into(),
            size: 2,
        },
        MaestroError::StateCorruption("revision mismatch".into()),
        MaestroError::Cancelled("!stop".into()),
    ];

    for err in &errors {
        let report = ErrorReport::from(err);
        assert!(!report.message.is_empty());
        assert_eq!(report.kind, err.kind());
    }
}

// ---------------------------------------------------------------------------
// 2. IO and JSON errors convert via `?`
// ---------------------------------------------------------------------------

fn parse(input: &str) -> MaestroResult<serde_json::Value> {
    Ok(serde_json::from_str(input)?)
}

#[test]
fn json_errors_convert() {
    let err = parse("{not json").unwrap_err();
    assert!(matches!(err, MaestroError::Json(_)));
    assert_eq!(err.kind(), ErrorKind::Internal);
}

// ---------------------------------------------------------------------------
// 3. Agent config round trip keeps the wire shape of the config API
// ---------------------------------------------------------------------------

#[test]
fn agent_config_wire_shape() {
    let cfg = AgentConfig::new("conductor")
        .with_tier(Tier::Full)
        .with_backend(BackendKind::McpBackend)
        .delegating();
    let json = serde_json::to_value(&cfg).unwrap();
    assert_eq!(json["key"], "conductor");
    assert_eq!(json["backend"], "mcp-backend");
    assert_eq!(json["tier"], 1);
    assert_eq!(json["can_delegate"], true);

    let back: AgentConfig = serde_json::from_value(json).unwrap();
    assert_eq!(back, cfg);
    assert_eq!(back.spec().backend, Some(BackendKind::McpBackend));
}
