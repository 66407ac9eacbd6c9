//! This crate provides the execution-control engine of the `domdbg`
//! debugger.
//!
//! Two main components are provided:
//! - A trait describing a guest domain handle, responsible for pausing the
//!   guest, reading and writing its VCPU state, and mapping its memory into
//!   the debugger's address space.
//! - The engine itself: a breakpoint table patching guest code with
//!   infinite-loop traps, an instruction predictor computing the possible
//!   successors of the current instruction, and a controller orchestrating
//!   continue/single-step over them.
//!
//! The engine works against any [Domain](self::domain::Domain)
//! implementation. Production debugging uses the Xen backend from
//! `domdbg-xen`; tests run against an in-memory mock.
//!
//! # Single-stepping
//!
//! Paravirtual guests offer no trap-based step facility, so stepping is
//! implemented by prediction: the instruction under the program counter is
//! decoded, traps are planted at its possible successors (both arms of a
//! conditional branch), and the guest is released until it halts on one of
//! them.

pub mod control;
pub mod domain;
pub mod predict;
pub mod regs;

mod breakpoint;
mod error;

pub use self::breakpoint::{Breakpoint, BreakpointManager, TRAP_WORD};
pub use self::error::{DomainError, Error, Result};
