/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// File open/read error.
    #[error("{0}: {1}")]
    File(std::path::PathBuf, std::io::Error),

    /// Error from the [goblin] crate.
    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),

    /// The binary carries no symbol with the given name.
    #[error("no such symbol: {0}")]
    NoSuchSymbol(String),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
