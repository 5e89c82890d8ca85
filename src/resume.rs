//! Resume-state tracking for time-limited archive runs.
//!
//! Archiving a large site rarely fits inside one bounded invocation, so every
//! mutating codec operation can yield cooperatively. The checkpoint data lives
//! in [`ResumeState`], owned by the caller between invocations; the codec is
//! stateless across calls except through this structure.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Checkpoint allowing a paused archive/extract operation to continue.
///
/// `file_position` and `initialization_vector` are non-zero only while
/// resuming inside a single file; once that file completes they reset, so a
/// state resumed at position zero is indistinguishable from a fresh start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Byte offset into the source file-list (packing) or into the archive
    /// stream at the current entry's header (extraction).
    #[serde(default)]
    pub list_position: u64,
    /// Byte offset into the file currently being written or read.
    #[serde(default)]
    pub file_position: u64,
    /// Acknowledged output length: the archive length while packing, the
    /// current output file's length while extracting. A resumed writer
    /// truncates back to this offset, so a replayed invocation overwrites
    /// the same byte range instead of appending it twice.
    #[serde(default)]
    pub bytes_written: u64,
    /// Count of fully completed entries.
    #[serde(default)]
    pub files_archived: u64,
    /// IV needed to resume mid-file encryption; empty between files.
    #[serde(default)]
    pub initialization_vector: Vec<u8>,
}

impl ResumeState {
    /// Flatten into the per-call parameters the codec needs, defaulting every
    /// absent field to its zero value.
    pub fn unpack(&self) -> (u64, u64, u64, u64, Vec<u8>) {
        (
            self.list_position,
            self.file_position,
            self.bytes_written,
            self.files_archived,
            self.initialization_vector.clone(),
        )
    }

    /// True when no progress has been recorded yet.
    pub fn is_fresh(&self) -> bool {
        *self == ResumeState::default()
    }

    /// True when the checkpoint sits inside a partially-processed file.
    pub fn mid_file(&self) -> bool {
        self.file_position > 0
    }
}

/// Three-way outcome of a mutating codec operation.
///
/// A `Partial` is a cooperative-yield signal, not a failure: the caller must
/// invoke the same operation again with the carried [`ResumeState`].
/// Unrecoverable failures travel separately as `Err(WprimeError)`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The operation ran to the end; `offset` is the running byte offset of
    /// the archive after the last entry written or read.
    Complete { offset: u64 },
    /// Time budget exhausted; call again with this state.
    Partial(ResumeState),
}

impl StepOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, StepOutcome::Complete { .. })
    }

    /// The resume state to carry into the next invocation, or `None` when done.
    pub fn into_resume_state(self) -> Option<ResumeState> {
        match self {
            StepOutcome::Complete { .. } => None,
            StepOutcome::Partial(state) => Some(state),
        }
    }
}

/// Wall-clock budget for one invocation.
///
/// The codec checks the budget only after durably flushing a chunk, and always
/// makes at least one chunk of progress per call, so a zero ceiling still
/// terminates.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    start: Instant,
    ceiling: Option<Duration>,
}

impl TimeBudget {
    /// Budget starting now with the given ceiling.
    pub fn starting_now(ceiling: Duration) -> Self {
        TimeBudget { start: Instant::now(), ceiling: Some(ceiling) }
    }

    /// Budget that never yields; for hosts without a request time limit.
    pub fn unlimited() -> Self {
        TimeBudget { start: Instant::now(), ceiling: None }
    }

    pub fn exhausted(&self) -> bool {
        match self.ceiling {
            Some(limit) => self.start.elapsed() >= limit,
            None => false,
        }
    }
}
