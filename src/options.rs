//! Parse configuration: strictness policy, resource limits, cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What happens when a field fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// The first fatal error aborts the parse; the partial tree is still returned.
    #[default]
    Strict,
    /// Failures are recorded and parsing continues with the next field whenever the cursor
    /// position is known (the failed field had a size budget). Validation failures keep
    /// the decoded value; unmatched switch cases keep the bytes as an opaque blob.
    Permissive,
}

/// Caps on work implied by attacker-controlled counts and sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of elements in one repeated field.
    pub max_repeat: u64,
    /// Maximum nesting of user-type nodes (including instance evaluation).
    pub max_depth: usize,
    /// Maximum number of field parses in one document.
    pub max_steps: u64,
    /// Maximum size in bytes of a single transform output.
    pub max_transform_output: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_repeat: 1_000_000,
            max_depth: 64,
            max_steps: 10_000_000,
            max_transform_output: 256 * 1024 * 1024,
        }
    }
}

/// Shared flag checked between field parses.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub strictness: Strictness,
    pub limits: Limits,
    pub cancel: Option<CancelToken>,
}

impl ParseOptions {
    pub fn strict() -> Self {
        ParseOptions::default()
    }

    pub fn permissive() -> Self {
        ParseOptions { strictness: Strictness::Permissive, ..ParseOptions::default() }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_repeat(mut self, n: u64) -> Self {
        self.limits.max_repeat = n;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_permissive(&self) -> bool {
        self.strictness == Strictness::Permissive
    }
}
