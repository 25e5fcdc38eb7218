// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests: `decode(encode(e)) == e` for every valid envelope.

use proptest::prelude::*;
use steward_core::{ErrorDetail, ResourcesUsed, SchedulingHints, WireErrorCode, WorkType};
use steward_proto::{
    Codec, Envelope, MessageBody, StepReport, WorkRequest, WorkResult, WorkResultKind, WorkStatus,
    WorkStatusKind,
};
use uuid::Uuid;

fn arb_uuid() -> impl Strategy<Value = Uuid> {
    any::<[u8; 16]>().prop_map(Uuid::from_bytes)
}

fn arb_work_type() -> impl Strategy<Value = WorkType> {
    prop_oneof![
        Just(WorkType::RunPlaybook),
        Just(WorkType::DeployService),
        Just(WorkType::DiscoverPlaybooks),
        Just(WorkType::RestartService),
    ]
}

fn arb_body() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        (arb_uuid(), arb_work_type(), "[a-z0-9_./-]{0,40}").prop_map(
            |(task_id, work_type, playbook)| {
                MessageBody::WorkRequest(WorkRequest {
                    task_id,
                    work_type,
                    parameters: serde_json::json!({ "playbook": playbook }),
                    hints: SchedulingHints {
                        max_duration_seconds: Some(120),
                        max_memory_mb: None,
                    },
                })
            }
        ),
        (arb_uuid(), 0u32..50, "[ -~]{0,200}").prop_map(|(task_id, number, output)| {
            MessageBody::WorkStatus(WorkStatus {
                task_id,
                status: WorkStatusKind::StepCompleted,
                progress_percent: Some(50.0),
                step: Some(StepReport {
                    number,
                    name: "step".into(),
                    output: Some(output),
                    output_chunk: None,
                    duration_ms: Some(12),
                }),
            })
        }),
        (arb_uuid(), any::<bool>(), -2i32..255, "[ -~]{0,200}").prop_map(
            |(task_id, ok, exit_code, output)| {
                MessageBody::WorkResult(WorkResult {
                    task_id,
                    status: if ok {
                        WorkResultKind::Success
                    } else {
                        WorkResultKind::Failed
                    },
                    exit_code,
                    output,
                    resources_used: ResourcesUsed {
                        duration_seconds: 1.5,
                        gpu_vram_mb: Some(2048),
                        cpu_time_ms: Some(900),
                    },
                })
            }
        ),
        (0..steward_core::error::ALL_CODES.len()).prop_map(|idx| {
            let code = steward_core::error::ALL_CODES[idx];
            MessageBody::Error(ErrorDetail::new(code).with_context("queue", "agent.ansible"))
        }),
    ]
}

proptest! {
    #[test]
    fn decode_inverts_encode(body in arb_body(), request_id in arb_uuid(), agent in "[a-z]{1,12}") {
        let envelope = Envelope::to_orchestrator(agent, request_id, body);
        let bytes = Codec::encode(&envelope).unwrap();
        let decoded = Codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn encode_is_deterministic(body in arb_body(), request_id in arb_uuid()) {
        let envelope = Envelope::to_agent("ansible", request_id, body);
        let first = Codec::encode(&envelope).unwrap();
        let second = Codec::encode(&envelope).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = Codec::decode(&bytes);
    }
}

#[test]
fn error_codes_survive_the_wire() {
    for code in steward_core::error::ALL_CODES {
        let envelope = Envelope::to_orchestrator(
            "ansible",
            Uuid::new_v4(),
            MessageBody::Error(ErrorDetail::new(*code)),
        );
        let decoded = Codec::decode(&Codec::encode(&envelope).unwrap()).unwrap();
        match decoded.body {
            MessageBody::Error(detail) => assert_eq!(detail.error_code, *code),
            _ => panic!("expected error body"),
        }
    }
}

#[test]
fn equal_code_means_retryability_agrees() {
    assert!(WireErrorCode::Timeout.is_retryable());
    assert!(!WireErrorCode::UnsupportedProtocolVersion.is_retryable());
}
