//! Error types for consensus validation
//!
//! Two layers: [`Rejection`] is the verdict on a transaction or block and
//! always carries a reason string plus a misbehavior score, while
//! [`ConsensusError`] covers process-level failures (storage, files, abort).

use thiserror::Error;

/// Reject codes carried in verdicts, matching the wire reject message values
pub mod reject {
    pub const MALFORMED: u32 = 0x01;
    pub const INVALID: u32 = 0x10;
    pub const OBSOLETE: u32 = 0x11;
    pub const DUPLICATE: u32 = 0x12;
    pub const NONSTANDARD: u32 = 0x40;
    pub const DUST: u32 = 0x41;
    pub const INSUFFICIENTFEE: u32 = 0x42;
    pub const CHECKPOINT: u32 = 0x43;
    /// Local-only codes, never sent to peers
    pub const HIGHFEE: u32 = 0x100;
    pub const ALREADY_KNOWN: u32 = 0x101;
    pub const CONFLICT: u32 = 0x102;
}

/// Category of a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Structural or consensus violation; scored when dos > 0
    Consensus,
    /// Standardness rule, never scored
    Policy,
    /// Fee floor, pool full, rate limit: may succeed later
    ResourcePressure,
    /// An input is unknown; hold as orphan
    MissingInputs,
    /// Invariant violation inside this crate
    Internal,
    /// Storage failure while validating
    Io,
}

/// Verdict carried by every failed validation step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (code {code:#x}, dos {dos}) {debug}")]
pub struct Rejection {
    pub kind: RejectionKind,
    pub code: u32,
    pub reason: String,
    pub dos: u32,
    pub debug: String,
    pub corruption_possible: bool,
}

impl Rejection {
    fn new(kind: RejectionKind, dos: u32, code: u32, reason: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            reason: reason.into(),
            dos,
            debug: String::new(),
            corruption_possible: false,
        }
    }

    /// Consensus violation with a misbehavior score
    pub fn dos(dos: u32, code: u32, reason: impl Into<String>) -> Self {
        Self::new(RejectionKind::Consensus, dos, code, reason)
    }

    /// Consensus violation that is not scored
    pub fn invalid(code: u32, reason: impl Into<String>) -> Self {
        Self::new(RejectionKind::Consensus, 0, code, reason)
    }

    pub fn policy(code: u32, reason: impl Into<String>) -> Self {
        Self::new(RejectionKind::Policy, 0, code, reason)
    }

    pub fn resource(code: u32, reason: impl Into<String>) -> Self {
        Self::new(RejectionKind::ResourcePressure, 0, code, reason)
    }

    pub fn missing_inputs() -> Self {
        Self::new(RejectionKind::MissingInputs, 0, 0, "missing-inputs")
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(RejectionKind::Internal, 0, 0, reason)
    }

    pub fn io(reason: impl Into<String>) -> Self {
        Self::new(RejectionKind::Io, 0, 0, reason)
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = debug.into();
        self
    }

    /// The object may be fine and only our copy corrupted (merkle mismatch)
    pub fn with_corruption_possible(mut self) -> Self {
        self.corruption_possible = true;
        self
    }

    /// Verdict against the object itself rather than our ability to judge it
    pub fn is_invalid(&self) -> bool {
        matches!(
            self.kind,
            RejectionKind::Consensus | RejectionKind::Policy | RejectionKind::ResourcePressure
        )
    }

    /// Should the sender be scored as hostile
    pub fn is_hostile(&self) -> bool {
        self.kind == RejectionKind::Consensus && self.dos > 0
    }

    /// Reason plus debug text for logs
    pub fn message(&self) -> String {
        if self.debug.is_empty() {
            format!("{} (code {})", self.reason, self.code)
        } else {
            format!("{}, {} (code {})", self.reason, self.debug, self.code)
        }
    }
}

/// Result of a validation step
pub type ValidationResult<T> = std::result::Result<T, Rejection>;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Fatal error, node shutting down: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_scoring() {
        let hostile = Rejection::dos(100, reject::INVALID, "bad-cb-multiple");
        assert!(hostile.is_hostile());
        assert!(hostile.is_invalid());

        let policy = Rejection::policy(reject::NONSTANDARD, "scriptpubkey");
        assert!(!policy.is_hostile());
        assert!(policy.is_invalid());

        let missing = Rejection::missing_inputs();
        assert!(!missing.is_invalid());
    }

    #[test]
    fn test_rejection_display() {
        let r = Rejection::dos(100, reject::INVALID, "bad-txnmrklroot")
            .with_debug("hashMerkleRoot mismatch")
            .with_corruption_possible();
        let text = r.to_string();
        assert!(text.starts_with("bad-txnmrklroot"));
        assert!(text.ends_with("hashMerkleRoot mismatch"));
        assert!(r.corruption_possible);
    }

    #[test]
    fn test_rejection_converts_to_consensus_error() {
        fn fails() -> Result<()> {
            Err::<(), _>(Rejection::internal("boom"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(ConsensusError::Rejected(_))));
    }
}
