//! Trait implemented by hypervisor backends to expose a guest domain.

use std::ops::{Deref, DerefMut};

use crate::regs::CpuContext;

/// Identifier of a guest virtual CPU.
pub type VcpuId = u32;

/// Pointer width of an attached guest.
///
/// Fixed for the lifetime of the attachment; selects the
/// [CpuContext](crate::regs::CpuContext) variant and the width of guest
/// words read from memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WordSize {
    /// 32-bit guest.
    Four,
    /// 64-bit guest.
    Eight,
}

impl WordSize {
    /// Byte width of a guest word.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Bit width of a guest word.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Four => 32,
            Self::Eight => 64,
        }
    }

    /// Converts a byte width into a `WordSize`.
    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

/// Access requested when mapping guest memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapProt {
    /// Read-only mapping.
    Read,
    /// Write-only mapping.
    Write,
    /// Read-write mapping.
    ReadWrite,
}

impl MapProt {
    /// Whether the mapping can be read from.
    pub const fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether writes through the mapping reach the guest.
    pub const fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Scoped view of a guest memory range.
///
/// The window behaves as a byte buffer at least as long as the mapped
/// range; writes (when mapped writable) become visible to the guest. The
/// underlying mapping is released when the window is dropped, on every
/// exit path.
pub trait MemoryWindow: Deref<Target = [u8]> + DerefMut {}

/// Handle over one guest domain, implemented by a hypervisor backend.
pub trait Domain {
    /// Memory window type returned by [map_memory](Self::map_memory).
    type Window: MemoryWindow;

    /// Error returned by this trait.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identifier of the guest domain.
    fn id(&self) -> u32;

    /// Pointer width of the guest.
    fn word_size(&self) -> WordSize;

    /// Number of VCPUs of the guest.
    fn vcpu_count(&self) -> u32;

    /// Blocks until the guest is no longer running on any VCPU.
    ///
    /// Idempotent.
    fn pause(&self) -> Result<(), Self::Error>;

    /// Releases the guest.
    ///
    /// Idempotent.
    fn unpause(&self) -> Result<(), Self::Error>;

    /// Snapshots the register file of the given VCPU.
    ///
    /// Only meaningful while the guest is paused.
    fn get_cpu_context(&self, vcpu: VcpuId) -> Result<CpuContext, Self::Error>;

    /// Writes back a register file to the given VCPU.
    ///
    /// Only meaningful while the guest is paused.
    fn set_cpu_context(&self, vcpu: VcpuId, ctx: &CpuContext) -> Result<(), Self::Error>;

    /// Enables (or disables) hypervisor-side debug support for the guest.
    fn set_debugging(&self, enable: bool) -> Result<(), Self::Error>;

    /// Maps `len` bytes of guest memory at `addr` into the local address
    /// space.
    ///
    /// The returned window is at least `len` bytes long; the mapping is
    /// released when the window is dropped.
    fn map_memory(&self, addr: u64, len: usize, prot: MapProt) -> Result<Self::Window, Self::Error>;
}
