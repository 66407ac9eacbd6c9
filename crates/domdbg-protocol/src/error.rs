/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Decoded request payload length did not match the expected width.
    #[error("bad packet size: got {actual}, expected {expected}")]
    PacketSize {
        /// Length carried by the packet.
        actual: usize,
        /// Length the packet kind requires.
        expected: usize,
    },

    /// Encountered a guest word size other than 4 or 8.
    #[error("bad guest word size: {0}")]
    WordSize(usize),

    /// Thread-list responses must carry at least one thread ID.
    #[error("empty thread ID list")]
    EmptyThreadList,

    /// Request payload is not valid for its packet kind.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Non-hexadecimal digit in a hex field.
    #[error("invalid hex digit")]
    InvalidHex,

    /// Frame checksum mismatch.
    #[error("bad frame checksum: got {got:#04x}, computed {computed:#04x}")]
    Checksum {
        /// Checksum carried by the frame.
        got: u8,
        /// Checksum computed over the payload.
        computed: u8,
    },
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
