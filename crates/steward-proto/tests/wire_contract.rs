// SPDX-License-Identifier: MIT OR Apache-2.0
//! The wire shape is a public contract: field names, type tags, and
//! payload layouts must not drift.

use chrono::TimeZone;
use std::collections::BTreeSet;
use steward_core::{ResourcesUsed, SchedulingHints, WorkType};
use steward_proto::{Codec, Envelope, MessageBody, WorkRequest, WorkResult, WorkResultKind};
use uuid::Uuid;

fn fixed_envelope() -> Envelope {
    let mut envelope = Envelope::to_agent(
        "ansible",
        Uuid::parse_str("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeffff").unwrap(),
        MessageBody::WorkRequest(WorkRequest {
            task_id: Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap(),
            work_type: WorkType::RunPlaybook,
            parameters: serde_json::json!({"playbook": "uptime-kuma.yml"}),
            hints: SchedulingHints {
                max_duration_seconds: Some(120),
                max_memory_mb: Some(512),
            },
        }),
    );
    envelope.message_id = Uuid::parse_str("99999999-8888-7777-6666-555555555555").unwrap();
    envelope.trace_id = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
    envelope.timestamp = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    envelope
}

#[test]
fn top_level_field_set_matches_contract() {
    let bytes = Codec::encode(&fixed_envelope()).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let keys: BTreeSet<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
    // `extensions` is omitted when empty; everything else is present.
    let expected: BTreeSet<&str> = [
        "protocol_version",
        "message_id",
        "from_agent",
        "to_agent",
        "timestamp",
        "trace_id",
        "request_id",
        "type",
        "payload",
    ]
    .into_iter()
    .collect();
    assert_eq!(keys, expected);
}

#[test]
fn work_request_golden_bytes() {
    let bytes = Codec::encode(&fixed_envelope()).unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert_eq!(
        text,
        concat!(
            r#"{"from_agent":"orchestrator","message_id":"99999999-8888-7777-6666-555555555555","#,
            r#""payload":{"hints":{"max_duration_seconds":120,"max_memory_mb":512},"#,
            r#""parameters":{"playbook":"uptime-kuma.yml"},"#,
            r#""task_id":"11111111-2222-3333-4444-555555555555","work_type":"run_playbook"},"#,
            r#""protocol_version":"1.0","request_id":"aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeffff","#,
            r#""timestamp":"2025-06-01T12:00:00Z","to_agent":"ansible","#,
            r#""trace_id":"00000000-0000-0000-0000-000000000001","type":"work_request"}"#
        )
    );
}

#[test]
fn work_result_payload_field_names() {
    let envelope = Envelope::to_orchestrator(
        "ansible",
        Uuid::new_v4(),
        MessageBody::WorkResult(WorkResult {
            task_id: Uuid::new_v4(),
            status: WorkResultKind::Failed,
            exit_code: 2,
            output: "fatal: unreachable".into(),
            resources_used: ResourcesUsed {
                duration_seconds: 1.25,
                gpu_vram_mb: Some(0),
                cpu_time_ms: Some(900),
            },
        }),
    );
    let value: serde_json::Value =
        serde_json::from_slice(&Codec::encode(&envelope).unwrap()).unwrap();
    assert_eq!(value["type"], "work_result");
    let payload = &value["payload"];
    assert_eq!(payload["status"], "failed");
    assert_eq!(payload["exit_code"], 2);
    assert_eq!(payload["resources_used"]["duration_seconds"], 1.25);
    assert_eq!(payload["resources_used"]["cpu_time_ms"], 900);
}

#[test]
fn timestamps_are_iso8601_utc() {
    let value: serde_json::Value =
        serde_json::from_slice(&Codec::encode(&fixed_envelope()).unwrap()).unwrap();
    let ts = value["timestamp"].as_str().unwrap();
    assert!(ts.ends_with('Z'), "UTC designator required, got {ts}");
    assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
}
