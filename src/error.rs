use thiserror::Error;

/// The precise hacking formulas are not available to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hacking formulas are unavailable")]
pub struct FormulaUnavailable;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Something the daemon cannot run without is missing. Not retried.
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("target {target} reported inconsistent data: {reason}")]
    InconsistentTarget {
        target: String,
        reason: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("oracle query failed for {host}: {what}")]
    Oracle {
        host: String,
        what: &'static str,
    },
}

/// Why an allocation did not place every requested thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("only {placed} of {requested} threads fit into free RAM")]
    InsufficientRam {
        placed: usize,
        requested: usize,
    },

    #[error("exec kept failing on {host} after {attempts} attempts")]
    RetriesExhausted {
        host: String,
        attempts: usize,
    },
}
