//! Fatal conditions raised while classifying received datagrams

/// Any of these invalidates the measurement, so the run stops immediately
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Tag outside WARMUP/DATA/QUIT: foreign sender or corrupted traffic
    #[error("unexpected message type 0x{0:02x}")]
    UnknownMessageType(u32),

    /// Every datagram in a run must have the length of the first one
    #[error("datagram length changed mid-run: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        expected: usize,
        actual: usize,
    },

    /// Too short to hold the tag and sequence fields
    #[error("datagram of {0} bytes is shorter than the 8-byte header")]
    Truncated(usize),

    #[error("receive failed: {0}")]
    Io(#[from] std::io::Error),
}
