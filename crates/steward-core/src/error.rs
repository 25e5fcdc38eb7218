// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Wire error-code registry.
//!
//! Every error that crosses the wire between the orchestrator and an
//! agent carries a numeric code in the `5001..5999` band. Codes are
//! classified as retryable (transient transport/agent conditions) or
//! permanent (protocol and authorization failures); the scheduler's
//! retry policy consumes that classification.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Enumeration of all wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum WireErrorCode {
    /// 5001 — the agent did not produce a result within the deadline.
    Timeout,
    /// 5002 — no agent was reachable for the work.
    AgentUnavailable,
    /// 5003 — the message failed structural validation.
    InvalidMessage,
    /// 5004 — the bearer token did not verify.
    AuthFailed,
    /// 5005 — the agent hit a resource limit while executing.
    ResourceLimit,
    /// 5006 — the agent does not implement the requested work type.
    UnsupportedWorkType,
    /// 5007 — the envelope's protocol version is not supported.
    UnsupportedProtocolVersion,
    /// 5008 — the orchestrator abandoned the work (user cancel or
    /// shutdown); agents should stop and discard the task.
    OperationCancelled,
}

/// All wire error codes, in numeric order.
pub const ALL_CODES: &[WireErrorCode] = &[
    WireErrorCode::Timeout,
    WireErrorCode::AgentUnavailable,
    WireErrorCode::InvalidMessage,
    WireErrorCode::AuthFailed,
    WireErrorCode::ResourceLimit,
    WireErrorCode::UnsupportedWorkType,
    WireErrorCode::UnsupportedProtocolVersion,
    WireErrorCode::OperationCancelled,
];

impl WireErrorCode {
    /// The numeric wire code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Timeout => 5001,
            Self::AgentUnavailable => 5002,
            Self::InvalidMessage => 5003,
            Self::AuthFailed => 5004,
            Self::ResourceLimit => 5005,
            Self::UnsupportedWorkType => 5006,
            Self::UnsupportedProtocolVersion => 5007,
            Self::OperationCancelled => 5008,
        }
    }

    /// Look up a code by its numeric value.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        ALL_CODES.iter().find(|c| c.code() == code).copied()
    }

    /// Returns `true` for transient conditions the scheduler may retry.
    ///
    /// # Examples
    ///
    /// ```
    /// use steward_core::WireErrorCode;
    ///
    /// assert!(WireErrorCode::Timeout.is_retryable());
    /// assert!(!WireErrorCode::AuthFailed.is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::AgentUnavailable | Self::ResourceLimit
        )
    }

    /// Short human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Timeout => "the agent did not produce a result within the deadline",
            Self::AgentUnavailable => "no agent was reachable for the work",
            Self::InvalidMessage => "the message failed structural validation",
            Self::AuthFailed => "the bearer token did not verify",
            Self::ResourceLimit => "the agent hit a resource limit while executing",
            Self::UnsupportedWorkType => "the agent does not implement the requested work type",
            Self::UnsupportedProtocolVersion => "the envelope's protocol version is not supported",
            Self::OperationCancelled => "the orchestrator abandoned the work",
        }
    }
}

impl From<WireErrorCode> for u16 {
    fn from(code: WireErrorCode) -> Self {
        code.code()
    }
}

impl TryFrom<u16> for WireErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        WireErrorCode::from_code(value).ok_or_else(|| format!("unknown wire error code {value}"))
    }
}

impl fmt::Display for WireErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl JsonSchema for WireErrorCode {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "WireErrorCode".into()
    }

    fn json_schema(_generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        schemars::json_schema!({
            "type": "integer",
            "enum": ALL_CODES.iter().map(|c| c.code()).collect::<Vec<_>>(),
        })
    }
}

/// Structured error payload carried by `error` envelopes and surfaced
/// at the request boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorDetail {
    /// Numeric wire code.
    pub error_code: WireErrorCode,
    /// Human-readable message.
    pub error_message: String,
    /// Machine-readable context (deterministic key ordering).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_context: BTreeMap<String, String>,
}

impl ErrorDetail {
    /// Build a detail for the given code with the catalog description.
    #[must_use]
    pub fn new(code: WireErrorCode) -> Self {
        Self {
            error_code: code,
            error_message: code.description().to_string(),
            error_context: BTreeMap::new(),
        }
    }

    /// Override the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Add a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.error_context.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_code.code(), self.error_message)?;
        if !self.error_context.is_empty() {
            write!(f, " (")?;
            let mut first = true;
            for (k, v) in &self.error_context {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{k}={v}")?;
                first = false;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorDetail {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_contiguous_from_5001() {
        for (i, code) in ALL_CODES.iter().enumerate() {
            assert_eq!(code.code(), 5001 + i as u16);
        }
    }

    #[test]
    fn retryable_set_matches_registry() {
        let retryable: Vec<u16> = ALL_CODES
            .iter()
            .filter(|c| c.is_retryable())
            .map(|c| c.code())
            .collect();
        assert_eq!(retryable, vec![5001, 5002, 5005]);
    }

    #[test]
    fn lookup_rejects_unknown_codes() {
        assert_eq!(WireErrorCode::from_code(5000), None);
        assert_eq!(WireErrorCode::from_code(5099), None);
        assert_eq!(
            WireErrorCode::from_code(5006),
            Some(WireErrorCode::UnsupportedWorkType)
        );
        assert_eq!(
            WireErrorCode::from_code(5008),
            Some(WireErrorCode::OperationCancelled)
        );
    }

    #[test]
    fn serde_uses_numeric_codes() {
        let json = serde_json::to_string(&WireErrorCode::Timeout).unwrap();
        assert_eq!(json, "5001");
        let back: WireErrorCode = serde_json::from_str("5005").unwrap();
        assert_eq!(back, WireErrorCode::ResourceLimit);
        assert!(serde_json::from_str::<WireErrorCode>("4999").is_err());
    }

    #[test]
    fn detail_display_includes_context() {
        let detail = ErrorDetail::new(WireErrorCode::AgentUnavailable)
            .with_message("no ansible agent")
            .with_context("work_type", "run_playbook");
        let text = detail.to_string();
        assert!(text.contains("5002"));
        assert!(text.contains("work_type=run_playbook"));
    }
}
