// LININOIO ETHERD — ERROR TYPE

use thiserror::Error;

/// Crate-wide error. Protocol-level rejections (malformed frame, unknown
/// channel) are reported here, logged by the caller and otherwise dropped;
/// they never abort the daemon.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated or malformed {0} packet")]
    Malformed(&'static str),

    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),

    #[error("no handler for protocol {0:#06x}")]
    NoHandler(u16),

    #[error("handler connect failed for protocol {0:#06x}")]
    ConnectFailed(u16),

    #[error("offset {offset:#x} + len {len:#x} outside mapped region ({map_len:#x})")]
    OutOfRange { offset: u64, len: u64, map_len: u64 },

    #[error("vring descriptor index {0} out of range ({1} descriptors)")]
    BadDescriptor(u16, u16),
}

pub type Result<T> = std::result::Result<T, Error>;
