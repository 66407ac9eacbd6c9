/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// File or socket I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// OS error from an ioctl or memory mapping.
    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    /// The hypervisor refused to map one of the requested pages.
    #[error("failed to map guest page {0} of {1}")]
    MapFailed(usize, usize),

    /// The physical-to-machine table carries no valid frame for the pfn.
    #[error("invalid page frame for pfn {0:#x}")]
    InvalidFrame(u64),

    /// The guest reports a word size other than 4 or 8 bytes.
    #[error("unsupported guest word size: {0} bits")]
    WordSize(u32),

    /// Error reply from xenstored.
    #[error("store error: {0}")]
    Store(String),

    /// Short or inconsistent reply from xenstored.
    #[error("bad store reply")]
    BadStoreReply,

    /// No domain carries the given name.
    #[error("domain \"{0}\" not found")]
    DomainNotFound(String),

    /// The HVM context blob carries no CPU record for the vcpu.
    #[error("no CPU record for vcpu {0} in the HVM context")]
    MissingCpuRecord(u32),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
