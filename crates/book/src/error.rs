use thiserror::Error;

/// Verification and input errors raised while applying a book frame.
///
/// Sequence and checksum errors leave the store reset and unready; the
/// caller must resubscribe to receive a fresh snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    #[error("frame for {got} does not belong to book {expected}")]
    IdentityMismatch { expected: String, got: String },

    #[error("book {channel}/{inst_id} is not ready: update received before snapshot")]
    NotReady { channel: String, inst_id: String },

    #[error(
        "sequence gap on {channel}/{inst_id}: expected prevSeqId {expected_prev}, got {got_prev} (seqId {seq_id})"
    )]
    SequenceGap {
        channel: String,
        inst_id: String,
        expected_prev: i64,
        got_prev: i64,
        seq_id: i64,
    },

    #[error("checksum mismatch on {channel}/{inst_id}: declared {declared}, computed {computed}")]
    ChecksumMismatch {
        channel: String,
        inst_id: String,
        declared: i32,
        computed: i32,
    },

    #[error("invalid book payload: {0}")]
    InvalidPayload(String),
}

impl BookError {
    /// True for errors that discarded the stored book.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            BookError::NotReady { .. }
                | BookError::SequenceGap { .. }
                | BookError::ChecksumMismatch { .. }
        )
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BookError::IdentityMismatch { .. } => "identity",
            BookError::NotReady { .. } => "not_ready",
            BookError::SequenceGap { .. } => "sequence",
            BookError::ChecksumMismatch { .. } => "checksum",
            BookError::InvalidPayload(_) => "invalid",
        }
    }
}
