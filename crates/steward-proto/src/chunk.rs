// SPDX-License-Identifier: MIT OR Apache-2.0
//! Large-output chunking.
//!
//! A payload string over [`CHUNK_THRESHOLD_BYTES`] never travels
//! inline. The sender slices it into `work_status` messages whose step
//! carries an [`OutputChunk`] identifying `bytes start..end of total`;
//! the receiver reassembles by offset with [`ChunkAssembler`],
//! tolerating duplicate and out-of-order delivery.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::{StepReport, WorkStatus, WorkStatusKind};

/// UTF-8 length above which a payload field must be chunked: 256 KiB.
pub const CHUNK_THRESHOLD_BYTES: usize = 256 * 1024;

/// One slice of a large output: `bytes start..end of total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Byte offset of the first byte in `data`.
    pub start: u64,
    /// Byte offset one past the last byte in `data`.
    pub end: u64,
    /// Total byte length of the full output.
    pub total: u64,
    /// The slice itself (always whole UTF-8 characters).
    pub data: String,
}

/// Split `output` into `work_status` messages for the given step.
///
/// Small outputs produce a single message with inline `output`; large
/// ones produce one message per chunk. Slices always break on char
/// boundaries, so every chunk is valid UTF-8 on its own.
#[must_use]
pub fn chunk_output(
    task_id: Uuid,
    step_number: u32,
    step_name: &str,
    output: &str,
) -> Vec<WorkStatus> {
    if output.len() <= CHUNK_THRESHOLD_BYTES {
        return vec![WorkStatus {
            task_id,
            status: WorkStatusKind::StepCompleted,
            progress_percent: None,
            step: Some(StepReport {
                number: step_number,
                name: step_name.to_string(),
                output: Some(output.to_string()),
                output_chunk: None,
                duration_ms: None,
            }),
        }];
    }

    let total = output.len() as u64;
    let mut messages = Vec::new();
    let mut start = 0usize;
    while start < output.len() {
        let mut end = (start + CHUNK_THRESHOLD_BYTES).min(output.len());
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        messages.push(WorkStatus {
            task_id,
            status: WorkStatusKind::StepCompleted,
            progress_percent: None,
            step: Some(StepReport {
                number: step_number,
                name: step_name.to_string(),
                output: None,
                output_chunk: Some(OutputChunk {
                    start: start as u64,
                    end: end as u64,
                    total,
                    data: output[start..end].to_string(),
                }),
                duration_ms: None,
            }),
        });
        start = end;
    }
    messages
}

/// Errors from reassembling a chunk sequence.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// A chunk's advertised range does not match its data length.
    #[error("chunk range {start}..{end} does not match data length {actual}")]
    RangeMismatch {
        /// Advertised start offset.
        start: u64,
        /// Advertised end offset.
        end: u64,
        /// Actual byte length of the chunk data.
        actual: u64,
    },

    /// Chunks disagree about the total output length.
    #[error("chunk total changed from {expected} to {found}")]
    TotalMismatch {
        /// Total advertised by the first chunk.
        expected: u64,
        /// Total advertised by the conflicting chunk.
        found: u64,
    },

    /// The same offset arrived twice with different bytes.
    #[error("conflicting data for chunk at offset {start}")]
    Conflict {
        /// The conflicting offset.
        start: u64,
    },

    /// Reassembly finished with bytes missing.
    #[error("incomplete output: have {received} of {total} bytes")]
    Incomplete {
        /// Bytes received so far.
        received: u64,
        /// Total expected.
        total: u64,
    },
}

/// Reassembles an output from its chunk sequence, keyed by offset.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    total: Option<u64>,
    pieces: BTreeMap<u64, String>,
}

impl ChunkAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one chunk. Duplicates with identical bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError`] when the chunk is internally inconsistent
    /// or conflicts with previously accepted chunks.
    pub fn push(&mut self, chunk: &OutputChunk) -> Result<(), ChunkError> {
        let advertised = chunk.end.saturating_sub(chunk.start);
        if advertised != chunk.data.len() as u64 {
            return Err(ChunkError::RangeMismatch {
                start: chunk.start,
                end: chunk.end,
                actual: chunk.data.len() as u64,
            });
        }
        match self.total {
            None => self.total = Some(chunk.total),
            Some(expected) if expected != chunk.total => {
                return Err(ChunkError::TotalMismatch {
                    expected,
                    found: chunk.total,
                });
            }
            Some(_) => {}
        }
        if let Some(existing) = self.pieces.get(&chunk.start) {
            if existing != &chunk.data {
                return Err(ChunkError::Conflict { start: chunk.start });
            }
            return Ok(());
        }
        self.pieces.insert(chunk.start, chunk.data.clone());
        Ok(())
    }

    /// Returns `true` once every byte of the output has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        self.received_bytes() == total
    }

    /// Bytes received so far.
    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        self.pieces.values().map(|d| d.len() as u64).sum()
    }

    /// Consume the assembler and return the full output.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Incomplete`] if any byte range is missing.
    pub fn finish(self) -> Result<String, ChunkError> {
        let total = self.total.unwrap_or(0);
        let mut expected_start = 0u64;
        let mut out = String::with_capacity(total as usize);
        for (start, data) in &self.pieces {
            if *start != expected_start {
                return Err(ChunkError::Incomplete {
                    received: self.received_bytes(),
                    total,
                });
            }
            out.push_str(data);
            expected_start = start + data.len() as u64;
        }
        if expected_start != total {
            return Err(ChunkError::Incomplete {
                received: expected_start,
                total,
            });
        }
        Ok(out)
    }
}
