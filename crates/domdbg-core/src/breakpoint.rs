use std::collections::HashMap;

use crate::domain::{Domain, MapProt};
use crate::error::{DomainError, Error};

/// Trap word patched over guest code: `EB FE`, an unconditional
/// jump-to-self.
///
/// It halts the guest deterministically at a known address without
/// requiring the hypervisor to deliver an exception to the debugger.
pub const TRAP_WORD: u16 = 0xfeeb;

/// Software breakpoint planted in guest memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Breakpoint {
    /// Identifier, monotonic within an attachment.
    pub id: u64,

    /// Guest virtual address of the patch.
    pub addr: u64,

    /// Guest word that existed at `addr` immediately before patching.
    pub orig_bytes: u16,
}

/// Table of patched guest addresses.
///
/// Holds the user-created breakpoints as well as, for the duration of a
/// single step, the transient traps planted at predicted successors. At
/// most one patch exists per address; while the table mutates guest
/// memory, the guest must be paused.
#[derive(Default)]
pub struct BreakpointManager {
    /// Live patches, by guest address.
    patches: HashMap<u64, Breakpoint>,

    /// Next breakpoint ID, never reused within an attachment.
    next_id: u64,
}

impl BreakpointManager {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the given address currently carries a patch.
    pub fn is_patched(&self, addr: u64) -> bool {
        self.patches.contains_key(&addr)
    }

    /// Looks up the patch at the given address.
    pub fn find_by_address(&self, addr: u64) -> Option<Breakpoint> {
        self.patches.get(&addr).copied()
    }

    /// Looks up a patch by its ID.
    pub fn find_by_id(&self, id: u64) -> Option<Breakpoint> {
        self.patches.values().find(|bp| bp.id == id).copied()
    }

    /// Iterates over the live patches, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.patches.values()
    }

    /// Number of live patches.
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Whether the table holds no patch.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Patches the trap word at `addr`, saving the bytes it replaces.
    ///
    /// Inserting at an already-patched address is a no-op returning the
    /// existing ID; the original bytes are never saved twice.
    pub fn insert<D: Domain>(&mut self, domain: &D, addr: u64) -> Result<u64, Error<D::Error>> {
        if let Some(bp) = self.patches.get(&addr) {
            tracing::warn!(
                addr = format_args!("{addr:#x}"),
                "trap already planted at this address; harmless, but may \
                 indicate a mispredicted successor"
            );
            return Ok(bp.id);
        }

        let mut window = domain
            .map_memory(addr, 2, MapProt::ReadWrite)
            .map_err(DomainError)?;

        let orig_bytes = u16::from_le_bytes([window[0], window[1]]);
        window[..2].copy_from_slice(&TRAP_WORD.to_le_bytes());
        drop(window);

        let id = self.next_id;
        self.next_id += 1;
        self.patches.insert(
            addr,
            Breakpoint {
                id,
                addr,
                orig_bytes,
            },
        );

        tracing::debug!(id, addr = format_args!("{addr:#x}"), "trap planted");

        Ok(id)
    }

    /// Restores the saved bytes at `addr` and drops the table entry.
    ///
    /// Returns the removed breakpoint, or `None` if the address carries no
    /// patch. If restoration fails the entry stays and the error is
    /// surfaced.
    pub fn remove_at<D: Domain>(
        &mut self,
        domain: &D,
        addr: u64,
    ) -> Result<Option<Breakpoint>, Error<D::Error>> {
        let Some(bp) = self.patches.get(&addr).copied() else {
            return Ok(None);
        };

        let mut window = domain
            .map_memory(addr, 2, MapProt::Write)
            .map_err(DomainError)?;

        window[..2].copy_from_slice(&bp.orig_bytes.to_le_bytes());
        drop(window);

        self.patches.remove(&addr);

        tracing::debug!(
            id = bp.id,
            addr = format_args!("{addr:#x}"),
            "trap restored"
        );

        Ok(Some(bp))
    }

    /// Restores and removes the breakpoint with the given ID.
    pub fn remove_by_id<D: Domain>(&mut self, domain: &D, id: u64) -> Result<(), Error<D::Error>> {
        let addr = self
            .find_by_id(id)
            .map(|bp| bp.addr)
            .ok_or(Error::NoSuchBreakpoint(id))?;

        self.remove_at(domain, addr).map(drop)
    }

    /// Re-patches a previously lifted breakpoint, keeping its ID.
    ///
    /// The bytes currently at the address are saved anew.
    pub(crate) fn replant<D: Domain>(
        &mut self,
        domain: &D,
        bp: Breakpoint,
    ) -> Result<(), Error<D::Error>> {
        let mut window = domain
            .map_memory(bp.addr, 2, MapProt::ReadWrite)
            .map_err(DomainError)?;

        let orig_bytes = u16::from_le_bytes([window[0], window[1]]);
        window[..2].copy_from_slice(&TRAP_WORD.to_le_bytes());
        drop(window);

        self.patches.insert(bp.addr, Breakpoint { orig_bytes, ..bp });

        tracing::debug!(
            id = bp.id,
            addr = format_args!("{:#x}", bp.addr),
            "trap replanted"
        );

        Ok(())
    }

    /// Restores every patch and empties the table.
    ///
    /// All entries are attempted; the first failure is reported.
    pub fn drain<D: Domain>(&mut self, domain: &D) -> Result<(), Error<D::Error>> {
        let addrs: Vec<u64> = self.patches.keys().copied().collect();

        let mut first_err = None;

        for addr in addrs {
            if let Err(e) = self.remove_at(domain, addr) {
                tracing::error!(
                    error = %e,
                    addr = format_args!("{addr:#x}"),
                    "failed to restore trap"
                );
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Reads guest memory with every live patch overlaid by its original
    /// bytes, so observers never see the trap word.
    pub fn read_masking<D: Domain>(
        &self,
        domain: &D,
        addr: u64,
        len: usize,
    ) -> Result<Vec<u8>, Error<D::Error>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let window = domain
            .map_memory(addr, len, MapProt::Read)
            .map_err(DomainError)?;
        let mut data = window[..len].to_vec();
        drop(window);

        let end = addr + len as u64;

        for bp in self.patches.values() {
            let orig = bp.orig_bytes.to_le_bytes();

            if bp.addr >= addr && bp.addr < end {
                let off = (bp.addr - addr) as usize;
                data[off] = orig[0];
                if off + 1 < len {
                    data[off + 1] = orig[1];
                }
            } else if bp.addr + 1 == addr {
                // patch straddling the start of the range
                data[0] = orig[1];
            }
        }

        Ok(data)
    }

    /// Writes guest memory, replanting any patch the range touches so the
    /// breakpoints survive the overwrite.
    ///
    /// A patch whose trap word half-overlaps either edge of the range is
    /// lifted and replanted as well; its saved bytes are refreshed from
    /// the written data.
    pub fn write_retaining<D: Domain>(
        &mut self,
        domain: &D,
        addr: u64,
        data: &[u8],
    ) -> Result<(), Error<D::Error>> {
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len() as u64;

        // A patch at addr-1 has its second trap byte inside the range and
        // must be lifted as well; a patch at the last byte of the range is
        // already below addr + len.
        let start = if self.is_patched(addr.wrapping_sub(1)) {
            addr - 1
        } else {
            addr
        };
        let end = addr + len;

        let lifted: Vec<Breakpoint> = self
            .patches
            .values()
            .filter(|bp| bp.addr >= start && bp.addr < end)
            .copied()
            .collect();

        for bp in &lifted {
            self.remove_at(domain, bp.addr)?;
        }

        let mut window = domain
            .map_memory(addr, data.len(), MapProt::Write)
            .map_err(DomainError)?;
        window[..data.len()].copy_from_slice(data);
        drop(window);

        tracing::debug!(
            len = data.len(),
            addr = format_args!("{addr:#x}"),
            "guest memory written"
        );

        for bp in lifted {
            self.replant(domain, bp)?;
        }

        Ok(())
    }
}
