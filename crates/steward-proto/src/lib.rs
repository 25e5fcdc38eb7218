// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-proto
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Large-output chunking and reassembly.
pub mod chunk;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use steward_core::{
    ErrorDetail, PROTOCOL_VERSION, ResourcesUsed, SchedulingHints, WireErrorCode, WorkType,
    canonical_json,
};
use thiserror::Error;
use uuid::Uuid;

pub use chunk::{ChunkAssembler, OutputChunk, chunk_output};

/// Sender/receiver identity for the orchestrator side of the wire.
pub const ORCHESTRATOR_IDENT: &str = "orchestrator";

/// The JSON message structure exchanged between the orchestrator and
/// agents, bit-exact across any transport.
///
/// # Examples
///
/// ```
/// use steward_proto::{Envelope, MessageBody, WorkRequest, Codec};
/// use steward_core::WorkType;
/// use uuid::Uuid;
///
/// let envelope = Envelope::to_agent(
///     "ansible",
///     Uuid::new_v4(),
///     MessageBody::WorkRequest(WorkRequest {
///         task_id: Uuid::new_v4(),
///         work_type: WorkType::RunPlaybook,
///         parameters: serde_json::json!({"playbook": "kuma.yml"}),
///         hints: Default::default(),
///     }),
/// );
/// let bytes = Codec::encode(&envelope).unwrap();
/// let decoded = Codec::decode(&bytes).unwrap();
/// assert_eq!(decoded.message_id, envelope.message_id);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version, `"1.0"` for this contract.
    pub protocol_version: String,
    /// Unique identifier of this message.
    pub message_id: Uuid,
    /// Sender identity: `"orchestrator"` or an agent type.
    pub from_agent: String,
    /// Receiver identity: `"orchestrator"` or an agent type.
    pub to_agent: String,
    /// When the message was produced (ISO-8601 UTC).
    pub timestamp: DateTime<Utc>,
    /// Correlates all messages of one user request.
    pub trace_id: Uuid,
    /// Correlates one dispatch attempt with its status/result messages.
    pub request_id: Uuid,
    /// Discriminated message body (serialized as `type` + `payload`).
    #[serde(flatten)]
    pub body: MessageBody,
    /// Free-form extension fields (bearer token, tracing baggage).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Build an orchestrator→agent envelope with fresh message and
    /// trace identifiers.
    #[must_use]
    pub fn to_agent(agent_type: impl Into<String>, request_id: Uuid, body: MessageBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            message_id: Uuid::new_v4(),
            from_agent: ORCHESTRATOR_IDENT.to_string(),
            to_agent: agent_type.into(),
            timestamp: Utc::now(),
            trace_id: Uuid::new_v4(),
            request_id,
            body,
            extensions: BTreeMap::new(),
        }
    }

    /// Build an agent→orchestrator envelope (used by agents and tests).
    #[must_use]
    pub fn to_orchestrator(
        agent_type: impl Into<String>,
        request_id: Uuid,
        body: MessageBody,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            message_id: Uuid::new_v4(),
            from_agent: agent_type.into(),
            to_agent: ORCHESTRATOR_IDENT.to_string(),
            timestamp: Utc::now(),
            trace_id: Uuid::new_v4(),
            request_id,
            body,
            extensions: BTreeMap::new(),
        }
    }

    /// Set the trace id, correlating this message with a request.
    #[must_use]
    pub fn with_trace(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Attach an extension field.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// The bearer token carried in `extensions`, if any.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.extensions.get("bearer_token").and_then(|v| v.as_str())
    }

    /// The concrete agent identity carried in `extensions`.
    ///
    /// `from_agent` names the agent *type*; individual workers identify
    /// themselves here so the orchestrator can verify their token.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.extensions.get("agent_id").and_then(|v| v.as_str())
    }

    /// Attach the standard agent identity extensions.
    #[must_use]
    pub fn with_identity(self, agent_id: &str, bearer_token: &str) -> Self {
        self.with_extension("agent_id", serde_json::json!(agent_id))
            .with_extension("bearer_token", serde_json::json!(bearer_token))
    }
}

/// The four message kinds, discriminated by the wire `type` field with
/// the body under `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    /// Orchestrator asks an agent to execute a task.
    WorkRequest(WorkRequest),
    /// Agent reports progress.
    WorkStatus(WorkStatus),
    /// Agent reports the final outcome.
    WorkResult(WorkResult),
    /// Either side reports a wire-level error.
    Error(ErrorDetail),
}

impl MessageBody {
    /// Wire name of the message type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkRequest(_) => "work_request",
            Self::WorkStatus(_) => "work_status",
            Self::WorkResult(_) => "work_result",
            Self::Error(_) => "error",
        }
    }
}

/// Payload of a `work_request` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// The task being dispatched.
    pub task_id: Uuid,
    /// The action requested.
    pub work_type: WorkType,
    /// Work-type specific parameters.
    pub parameters: serde_json::Value,
    /// Scheduling hints (deadline, memory).
    #[serde(default)]
    pub hints: SchedulingHints,
}

/// Progress states an agent may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatusKind {
    /// Execution has started (or is continuing).
    Running,
    /// A named step finished.
    StepCompleted,
    /// The agent paused itself (e.g. waiting on a lock).
    Paused,
}

/// A named step inside a `work_status` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step ordinal within the task.
    pub number: u32,
    /// Human-readable step name.
    pub name: String,
    /// Inline output, only when it fits under the chunking threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// One slice of a large output, delivered as a chunk sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_chunk: Option<OutputChunk>,
    /// Step duration in milliseconds, when the agent measured it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Payload of a `work_status` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkStatus {
    /// The task the status belongs to.
    pub task_id: Uuid,
    /// What the agent reports.
    pub status: WorkStatusKind,
    /// Overall completion estimate, 0–100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    /// Step detail, when the status concerns a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepReport>,
}

/// Final states an agent may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkResultKind {
    /// The work completed successfully.
    Success,
    /// The work failed.
    Failed,
}

/// Payload of a `work_result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// The task the result belongs to.
    pub task_id: Uuid,
    /// Final status.
    pub status: WorkResultKind,
    /// Process exit code.
    pub exit_code: i32,
    /// Bounded output text.
    #[serde(default)]
    pub output: String,
    /// Resources the execution consumed.
    #[serde(default)]
    pub resources_used: ResourcesUsed,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors from decoding a wire message.
///
/// Each variant maps to a registry code so receivers can answer with a
/// proper `error` envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes were not valid JSON or did not match the contract (5003).
    #[error("invalid message: {reason}")]
    Invalid {
        /// Why validation failed.
        reason: String,
    },

    /// The protocol version is unsupported (5007).
    #[error("unsupported protocol version `{found}`, expected `{expected}`")]
    Version {
        /// The version string in the envelope.
        found: String,
        /// The version this build speaks.
        expected: &'static str,
    },
}

impl DecodeError {
    /// The registry code for this error.
    #[must_use]
    pub fn code(&self) -> WireErrorCode {
        match self {
            Self::Invalid { .. } => WireErrorCode::InvalidMessage,
            Self::Version { .. } => WireErrorCode::UnsupportedProtocolVersion,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Errors from encoding a wire message.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// JSON serialization failed.
    #[error("failed to serialize envelope: {0}")]
    Json(#[from] steward_core::ContractError),
}

/// Top-level field names every envelope may carry. Anything else is a
/// protocol violation.
const KNOWN_FIELDS: &[&str] = &[
    "protocol_version",
    "message_id",
    "from_agent",
    "to_agent",
    "timestamp",
    "trace_id",
    "request_id",
    "type",
    "payload",
    "extensions",
];

/// Stateless codec for the wire envelope.
#[derive(Debug, Clone, Copy)]
pub struct Codec;

impl Codec {
    /// Serialize an envelope to canonical JSON bytes.
    ///
    /// Field ordering is normalized, so encoding the same envelope
    /// twice yields identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the envelope cannot be serialized.
    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        Ok(canonical_json(envelope)?.into_bytes())
    }

    /// Parse and validate wire bytes into an [`Envelope`].
    ///
    /// Validation order matters: the version check runs before full
    /// structural validation so an old sender gets 5007, not 5003.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::Invalid`] (5003) for malformed JSON, unknown
    ///   top-level fields, or a body that does not match its `type`.
    /// - [`DecodeError::Version`] (5007) for an incompatible
    ///   `protocol_version`.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::invalid(format!("not valid JSON: {e}")))?;

        let object = value
            .as_object()
            .ok_or_else(|| DecodeError::invalid("envelope must be a JSON object"))?;

        let version = object
            .get("protocol_version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DecodeError::invalid("missing protocol_version"))?;
        if !is_compatible_version(version, PROTOCOL_VERSION) {
            return Err(DecodeError::Version {
                found: version.to_string(),
                expected: PROTOCOL_VERSION,
            });
        }

        for key in object.keys() {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                return Err(DecodeError::invalid(format!(
                    "unknown top-level field `{key}`"
                )));
            }
        }

        serde_json::from_value(value).map_err(|e| DecodeError::invalid(e.to_string()))
    }
}

/// Parse a `"MAJOR.MINOR"` version string into `(MAJOR, MINOR)`.
///
/// Returns `None` if the string does not match the expected format.
#[must_use]
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major_str, minor_str) = version.split_once('.')?;
    let major = major_str.parse::<u32>().ok()?;
    let minor = minor_str.parse::<u32>().ok()?;
    Some((major, minor))
}

/// Two versions are compatible when they share the same major component.
///
/// `"1.0"` and `"1.1"` are compatible; `"2.0"` and `"1.0"` are not.
/// Returns `false` if either string cannot be parsed.
#[must_use]
pub fn is_compatible_version(their_version: &str, our_version: &str) -> bool {
    match (parse_version(their_version), parse_version(our_version)) {
        (Some((their_major, _)), Some((our_major, _))) => their_major == our_major,
        _ => false,
    }
}
