//! Handle over one Xen guest domain.

use std::cell::RefCell;
use std::mem;

use domdbg_core::domain::{Domain, MapProt, VcpuId, WordSize};
use domdbg_core::regs::CpuContext;

use crate::error::Error;
use crate::sys::ctx::HvmHwCpu;
use crate::sys::p2m::P2m;
use crate::sys::privcmd::{HVM_SAVE_CODE_CPU, Privcmd, XEN_DOMINF_HVM_GUEST};
use crate::sys::{PAGE_SHIFT, PAGE_SIZE, foreign};

/// Virtualization mode of the guest.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum GuestKind {
    Pv,
    Hvm,
}

/// Handle over one Xen guest domain.
///
/// Implements the engine's [Domain] trait over privcmd hypercalls and
/// foreign-memory mappings.
pub struct XenDomain {
    privcmd: Privcmd,
    domid: u32,
    word_size: WordSize,
    max_vcpu_id: u32,
    shared_info_frame: u64,
    kind: GuestKind,

    /// Lazily indexed p2m table (PV guests only).
    p2m: RefCell<Option<P2m>>,
}

impl XenDomain {
    /// Opens a handle over the given domain ID.
    pub fn open(domid: u32) -> crate::Result<Self> {
        let privcmd = Privcmd::open()?;

        let info = privcmd.domain_info(domid)?;

        let bits = privcmd.address_size(domid)?;
        let word_size =
            WordSize::from_bytes(bits as usize / 8).ok_or(Error::WordSize(bits))?;

        let kind = if info.flags & XEN_DOMINF_HVM_GUEST != 0 {
            GuestKind::Hvm
        } else {
            GuestKind::Pv
        };

        tracing::info!(
            domid,
            word_size = word_size.bytes(),
            hvm = kind == GuestKind::Hvm,
            vcpus = info.max_vcpu_id + 1,
            "domain opened"
        );

        Ok(Self {
            privcmd,
            domid,
            word_size,
            max_vcpu_id: info.max_vcpu_id,
            shared_info_frame: info.shared_info_frame,
            kind,
            p2m: RefCell::new(None),
        })
    }

    /// Machine (PV) or guest (HVM) frame backing a guest pfn.
    fn frame_for(&self, pfn: u64) -> crate::Result<u64> {
        match self.kind {
            GuestKind::Hvm => Ok(pfn),
            GuestKind::Pv => {
                let mut p2m = self.p2m.borrow_mut();

                if p2m.is_none() {
                    *p2m = Some(P2m::load(
                        &self.privcmd,
                        self.domid,
                        self.word_size,
                        self.shared_info_frame,
                    )?);
                }

                match &*p2m {
                    Some(table) => table.lookup(&self.privcmd, self.domid, pfn),
                    None => Err(Error::InvalidFrame(pfn)),
                }
            }
        }
    }

    /// Patches the CPU record of one VCPU inside the HVM context blob.
    fn set_cpu_context_hvm(&self, vcpu: VcpuId, ctx: &CpuContext) -> crate::Result<()> {
        let mut blob = self.privcmd.hvm_context(self.domid)?;

        let mut off = 0;
        while off + 8 <= blob.len() {
            let typecode = u16::from_le_bytes([blob[off], blob[off + 1]]);
            let instance = u16::from_le_bytes([blob[off + 2], blob[off + 3]]);
            let length = u32::from_le_bytes([
                blob[off + 4],
                blob[off + 5],
                blob[off + 6],
                blob[off + 7],
            ]) as usize;

            let body = off + 8;
            if body + length > blob.len() {
                break;
            }

            if typecode == HVM_SAVE_CODE_CPU
                && u32::from(instance) == vcpu
                && length >= mem::size_of::<HvmHwCpu>()
            {
                let mut cpu: HvmHwCpu =
                    unsafe { std::ptr::read_unaligned(blob[body..].as_ptr().cast()) };
                cpu.apply_cpu_context(ctx);
                unsafe { std::ptr::write_unaligned(blob[body..].as_mut_ptr().cast(), cpu) };

                return self.privcmd.set_hvm_context(self.domid, &blob);
            }

            off = body + length;
        }

        Err(Error::MissingCpuRecord(vcpu))
    }
}

impl Domain for XenDomain {
    type Window = foreign::MappedPages;
    type Error = Error;

    fn id(&self) -> u32 {
        self.domid
    }

    fn word_size(&self) -> WordSize {
        self.word_size
    }

    fn vcpu_count(&self) -> u32 {
        self.max_vcpu_id + 1
    }

    fn pause(&self) -> crate::Result<()> {
        self.privcmd.pause(self.domid)
    }

    fn unpause(&self) -> crate::Result<()> {
        self.privcmd.unpause(self.domid)
    }

    fn get_cpu_context(&self, vcpu: VcpuId) -> crate::Result<CpuContext> {
        match self.kind {
            GuestKind::Pv => {
                let any = self.privcmd.get_vcpu_context(self.domid, vcpu)?;
                Ok(any.to_cpu_context(self.word_size))
            }
            GuestKind::Hvm => {
                let cpu = self.privcmd.hvm_cpu_record(self.domid, vcpu)?;
                Ok(cpu.to_cpu_context(self.word_size))
            }
        }
    }

    fn set_cpu_context(&self, vcpu: VcpuId, ctx: &CpuContext) -> crate::Result<()> {
        match self.kind {
            GuestKind::Pv => {
                // fetch-and-overlay keeps the fields the register file
                // does not carry
                let mut any = self.privcmd.get_vcpu_context(self.domid, vcpu)?;
                any.apply_cpu_context(ctx);
                self.privcmd.set_vcpu_context(self.domid, vcpu, &any)
            }
            GuestKind::Hvm => self.set_cpu_context_hvm(vcpu, ctx),
        }
    }

    fn set_debugging(&self, enable: bool) -> crate::Result<()> {
        self.privcmd.set_debugging(self.domid, enable)
    }

    fn map_memory(
        &self,
        addr: u64,
        len: usize,
        prot: MapProt,
    ) -> crate::Result<foreign::MappedPages> {
        let offset = (addr as usize) & (PAGE_SIZE - 1);
        let pages = (offset + len).div_ceil(PAGE_SIZE).max(1);
        let base_pfn = addr >> PAGE_SHIFT;

        let frames = (0..pages as u64)
            .map(|i| self.frame_for(base_pfn + i))
            .collect::<crate::Result<Vec<u64>>>()?;

        foreign::map_frames(&self.privcmd, self.domid, &frames, prot, offset, len)
    }
}
