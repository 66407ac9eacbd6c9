//! This crate provides the Xen backend of the `domdbg` debugger.
//!
//! It implements the [Domain](domdbg_core::domain::Domain) trait over the
//! Xen control plane, talking to the hypervisor directly through
//! `/dev/xen/privcmd` (domctl and memory-op hypercalls, foreign-memory
//! mappings) and to `xenstored` over its unix socket (domain
//! enumeration).
//!
//! Both paravirtual and HVM guests are supported. For PV guests, foreign
//! mappings go through the guest's physical-to-machine table; HVM guests
//! are mapped by guest frame number directly.

mod domain;
mod error;
mod sys;

pub use self::domain::XenDomain;
pub use self::error::{Error, Result};
pub use self::sys::foreign::MappedPages;
pub use self::sys::store::XenStore;
