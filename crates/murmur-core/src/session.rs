//! Per-submission session state.
//!
//! One `StreamSession` is constructed per submitted input and discarded at a
//! terminal state. It owns the accumulated text, the attempt counter, and the
//! single commit guard that keeps the append at-most-once when completion
//! signals race.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Streaming,
    Stalled,
    Committing,
    Committed,
    Failed,
}

/// Single-assignment flag checked before the side-effecting append call.
#[derive(Debug, Default)]
pub struct CommitGuard(AtomicBool);

impl CommitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the guard. Returns true exactly once; every later caller loses.
    pub fn arm(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct StreamSession {
    id: String,
    status: SessionStatus,
    accumulated: String,
    attempt: u32,
    commit_guard: CommitGuard,
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: SessionStatus::Idle,
            accumulated: String::new(),
            attempt: 0,
            commit_guard: CommitGuard::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Text accumulated so far in the current attempt. Append-only.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Enter Streaming with a fresh buffer. A retry is a clean restart, not
    /// a resume: partial text from the failed attempt is discarded.
    pub fn begin_attempt(&mut self) -> u32 {
        self.accumulated.clear();
        self.attempt += 1;
        self.status = SessionStatus::Streaming;
        self.attempt
    }

    pub fn apply_fragment(&mut self, text: &str) {
        debug_assert_eq!(self.status, SessionStatus::Streaming);
        self.accumulated.push_str(text);
    }

    /// Stall is soft completion: accumulated text so far becomes final.
    pub fn mark_stalled(&mut self) {
        self.status = SessionStatus::Stalled;
    }

    /// Transition into Committing. Returns false when the commit was already
    /// issued; the caller must not append in that case.
    pub fn begin_commit(&mut self) -> bool {
        if !self.commit_guard.arm() {
            return false;
        }
        self.status = SessionStatus::Committing;
        true
    }

    pub fn mark_committed(&mut self) {
        self.status = SessionStatus::Committed;
    }

    pub fn mark_failed(&mut self) {
        self.status = SessionStatus::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Committed | SessionStatus::Failed
        )
    }
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}
