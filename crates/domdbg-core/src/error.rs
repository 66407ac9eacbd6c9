/// Error raised by a guest domain backend.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct DomainError<E>(pub E);

/// Error type of this crate, generic over the domain backend error.
#[derive(thiserror::Error, Debug)]
pub enum Error<E> {
    /// A domain backend error occurred.
    #[error(transparent)]
    Domain(#[from] DomainError<E>),

    /// Error from the [capstone] disassembler.
    #[error(transparent)]
    Decoder(#[from] capstone::Error),

    /// A state-requiring operation was invoked without an attached guest.
    #[error("no guest attached")]
    NotAttached,

    /// No breakpoint carries the given ID.
    #[error("no such breakpoint: {0}")]
    NoSuchBreakpoint(u64),

    /// The register name is not part of the guest register file.
    #[error("no such register: {0}")]
    NoSuchRegister(String),

    /// The variable was never set (or was deleted).
    #[error("no such variable: {0}")]
    NoSuchVariable(String),

    /// The disassembler could not produce two instructions.
    #[error("failed to decode two instructions at the program counter")]
    DecodeFailed,

    /// The predictor hit a jump/call operand form it does not model.
    #[error("unsupported jump/call operand")]
    UnsupportedOperand,

    /// A pending continue or single-step was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type of this crate.
pub type Result<T, E> = core::result::Result<T, Error<E>>;
