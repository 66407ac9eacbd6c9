//! This crate implements the wire codec spoken to remote debugger clients
//! (GDB, LLDB) by the `domdbg` guest debugger.
//!
//! Three layers are provided:
//! - [Request]: parsing of unframed request payloads into a tagged
//!   variant, one per recognised packet kind. Unrecognised packets parse
//!   to [Request::Unknown] so the handler can answer
//!   [Response::NotSupported].
//! - [Response]: encoding of reply payloads. Values are serialised as
//!   lowercase hexadecimal, zero-padded to twice their byte width;
//!   multi-byte scalars are emitted in guest byte order (little-endian).
//! - [frame]: the `$payload#xx` checksum framing and acknowledgement
//!   bytes of the underlying transport.

pub mod frame;

mod error;
mod hex;
mod request;
mod response;

pub use self::error::{Error, Result};
pub use self::request::Request;
pub use self::response::{Encoding, Response};
