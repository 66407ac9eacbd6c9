//! Hypercalls through `/dev/xen/privcmd`.
//!
//! Hypercall argument buffers must reside in page-locked memory, so every
//! call brackets its buffers with `mlock`/`munlock`.

use std::fs::{File, OpenOptions};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::libc;

use super::ctx::{HvmHwCpu, VcpuGuestContextAny};
use crate::error::Error;

const HYPERVISOR_MEMORY_OP: u64 = 12;
const HYPERVISOR_DOMCTL: u64 = 36;

const XENMEM_MAXIMUM_GPFN: u64 = 14;

/// Interface version the domctl layouts below follow.
const XEN_DOMCTL_INTERFACE_VERSION: u32 = 0x15;

const XEN_DOMCTL_PAUSEDOMAIN: u32 = 3;
const XEN_DOMCTL_UNPAUSEDOMAIN: u32 = 4;
const XEN_DOMCTL_GETDOMAININFO: u32 = 5;
const XEN_DOMCTL_SETVCPUCONTEXT: u32 = 12;
const XEN_DOMCTL_GETVCPUCONTEXT: u32 = 13;
const XEN_DOMCTL_SETDEBUGGING: u32 = 18;
const XEN_DOMCTL_GETHVMCONTEXT: u32 = 33;
const XEN_DOMCTL_SETHVMCONTEXT: u32 = 34;
const XEN_DOMCTL_GET_ADDRESS_SIZE: u32 = 36;
const XEN_DOMCTL_GETHVMCONTEXT_PARTIAL: u32 = 55;

/// `getdomaininfo` flag set for HVM guests.
pub const XEN_DOMINF_HVM_GUEST: u32 = 1 << 1;

/// HVM save record type code of the CPU record.
pub const HVM_SAVE_CODE_CPU: u16 = 2;

// _IOC(_IOC_NONE, 'P', nr, size)
const fn ioc(nr: u64, size: usize) -> libc::c_ulong {
    ((size as u64) << 16 | (b'P' as u64) << 8 | nr) as libc::c_ulong
}

const IOCTL_PRIVCMD_HYPERCALL: libc::c_ulong = ioc(0, mem::size_of::<PrivcmdHypercall>());

/// Request code of the V2 batch-mapping ioctl, consumed by
/// [foreign](super::foreign).
pub const IOCTL_PRIVCMD_MMAPBATCH_V2: libc::c_ulong = ioc(4, mem::size_of::<PrivcmdMmapBatchV2>());

#[repr(C)]
struct PrivcmdHypercall {
    op: u64,
    arg: [u64; 5],
}

/// Argument block of `IOCTL_PRIVCMD_MMAPBATCH_V2`.
#[repr(C)]
#[allow(missing_docs)]
pub struct PrivcmdMmapBatchV2 {
    pub num: u32,
    pub dom: u16,
    pub addr: u64,
    pub arr: *const u64,
    pub err: *mut i32,
}

#[repr(C)]
struct XenDomctl {
    cmd: u32,
    interface_version: u32,
    domain: u16,
    _pad: [u16; 3],
    u: XenDomctlPayload,
}

#[repr(C)]
#[derive(Copy, Clone)]
union XenDomctlPayload {
    debugging: XenDomctlSetDebugging,
    address_size: XenDomctlAddressSize,
    vcpu_context: XenDomctlVcpuContext,
    get_domain_info: XenDomctlGetDomainInfo,
    hvm_context: XenDomctlHvmContext,
    hvm_context_partial: XenDomctlHvmContextPartial,
    pad: [u8; 120],
}

const EMPTY_PAYLOAD: XenDomctlPayload = XenDomctlPayload { pad: [0; 120] };

#[repr(C)]
#[derive(Copy, Clone)]
struct XenDomctlSetDebugging {
    enable: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct XenDomctlAddressSize {
    size: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct XenDomctlVcpuContext {
    vcpu: u32,
    _pad: u32,
    ctxt: u64,
}

/// Reply of `XEN_DOMCTL_getdomaininfo`.
#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct XenDomctlGetDomainInfo {
    pub domain: u16,
    pub _pad: u16,
    pub flags: u32,
    pub tot_pages: u64,
    pub max_pages: u64,
    pub outstanding_pages: u64,
    pub shr_pages: u64,
    pub paged_pages: u64,
    pub shared_info_frame: u64,
    pub cpu_time: u64,
    pub nr_online_vcpus: u32,
    pub max_vcpu_id: u32,
    pub ssidref: u32,
    pub handle: [u8; 16],
    pub cpupool: u32,
    pub gpaddr_bits: u8,
    pub _pad2: [u8; 7],
    pub arch_emulation_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct XenDomctlHvmContext {
    size: u32,
    _pad: u32,
    buffer: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct XenDomctlHvmContextPartial {
    typecode: u32,
    instance: u32,
    bufsz: u32,
    _pad: u32,
    buffer: u64,
}

/// Handle over `/dev/xen/privcmd`.
pub struct Privcmd {
    file: File,
}

impl Privcmd {
    /// Opens the privileged-command device.
    pub fn open() -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/xen/privcmd")?;

        tracing::debug!("privcmd opened");

        Ok(Self { file })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Issues one hypercall; `args` pointers must reference page-locked
    /// memory.
    fn hypercall(&self, op: u64, args: [u64; 5]) -> crate::Result<i64> {
        let mut call = PrivcmdHypercall { op, arg: args };

        let ret = unsafe {
            Errno::result(libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_PRIVCMD_HYPERCALL,
                &mut call as *mut PrivcmdHypercall,
            ))
        }
        .inspect_err(|e| tracing::error!(error = %e, op, "hypercall failed"))?;

        Ok(i64::from(ret))
    }

    fn domctl(&self, cmd: u32, domid: u32, u: XenDomctlPayload) -> crate::Result<XenDomctlPayload> {
        let mut call = XenDomctl {
            cmd,
            interface_version: XEN_DOMCTL_INTERFACE_VERSION,
            domain: domid as u16,
            _pad: [0; 3],
            u,
        };

        let res = with_locked(&mut call, |addr| {
            self.hypercall(HYPERVISOR_DOMCTL, [addr, 0, 0, 0, 0])
        })?;
        res?;

        Ok(call.u)
    }

    /// Blocks until no VCPU of the domain is running.
    pub fn pause(&self, domid: u32) -> crate::Result<()> {
        self.domctl(XEN_DOMCTL_PAUSEDOMAIN, domid, EMPTY_PAYLOAD)
            .map(drop)
    }

    /// Releases the domain.
    pub fn unpause(&self, domid: u32) -> crate::Result<()> {
        self.domctl(XEN_DOMCTL_UNPAUSEDOMAIN, domid, EMPTY_PAYLOAD)
            .map(drop)
    }

    /// Enables (or disables) debug support for the domain.
    pub fn set_debugging(&self, domid: u32, enable: bool) -> crate::Result<()> {
        let u = XenDomctlPayload {
            debugging: XenDomctlSetDebugging {
                enable: enable as u8,
            },
        };

        self.domctl(XEN_DOMCTL_SETDEBUGGING, domid, u).map(drop)
    }

    /// Snapshot of the domain's accounting info.
    pub fn domain_info(&self, domid: u32) -> crate::Result<XenDomctlGetDomainInfo> {
        let u = self.domctl(XEN_DOMCTL_GETDOMAININFO, domid, EMPTY_PAYLOAD)?;

        Ok(unsafe { u.get_domain_info })
    }

    /// Guest address size, in bits.
    pub fn address_size(&self, domid: u32) -> crate::Result<u32> {
        let u = self.domctl(XEN_DOMCTL_GET_ADDRESS_SIZE, domid, EMPTY_PAYLOAD)?;

        Ok(unsafe { u.address_size }.size)
    }

    /// Fetches the full PV context of one VCPU.
    pub fn get_vcpu_context(&self, domid: u32, vcpu: u32) -> crate::Result<VcpuGuestContextAny> {
        let mut ctxt: VcpuGuestContextAny = unsafe { mem::zeroed() };

        with_locked(&mut ctxt, |addr| {
            let u = XenDomctlPayload {
                vcpu_context: XenDomctlVcpuContext {
                    vcpu,
                    _pad: 0,
                    ctxt: addr,
                },
            };

            self.domctl(XEN_DOMCTL_GETVCPUCONTEXT, domid, u).map(drop)
        })??;

        Ok(ctxt)
    }

    /// Writes back the full PV context of one VCPU.
    pub fn set_vcpu_context(
        &self,
        domid: u32,
        vcpu: u32,
        ctxt: &VcpuGuestContextAny,
    ) -> crate::Result<()> {
        let mut ctxt = *ctxt;

        with_locked(&mut ctxt, |addr| {
            let u = XenDomctlPayload {
                vcpu_context: XenDomctlVcpuContext {
                    vcpu,
                    _pad: 0,
                    ctxt: addr,
                },
            };

            self.domctl(XEN_DOMCTL_SETVCPUCONTEXT, domid, u).map(drop)
        })?
    }

    /// Fetches the CPU save record of one HVM VCPU.
    pub fn hvm_cpu_record(&self, domid: u32, vcpu: u32) -> crate::Result<HvmHwCpu> {
        let mut cpu: HvmHwCpu = unsafe { mem::zeroed() };

        with_locked(&mut cpu, |addr| {
            let u = XenDomctlPayload {
                hvm_context_partial: XenDomctlHvmContextPartial {
                    typecode: u32::from(HVM_SAVE_CODE_CPU),
                    instance: vcpu,
                    bufsz: mem::size_of::<HvmHwCpu>() as u32,
                    _pad: 0,
                    buffer: addr,
                },
            };

            self.domctl(XEN_DOMCTL_GETHVMCONTEXT_PARTIAL, domid, u)
                .map(drop)
        })??;

        Ok(cpu)
    }

    /// Fetches the full HVM save context blob of the domain.
    pub fn hvm_context(&self, domid: u32) -> crate::Result<Vec<u8>> {
        // a null buffer makes the hypervisor report the required size
        let u = self.domctl(
            XEN_DOMCTL_GETHVMCONTEXT,
            domid,
            XenDomctlPayload {
                hvm_context: XenDomctlHvmContext {
                    size: 0,
                    _pad: 0,
                    buffer: 0,
                },
            },
        )?;
        let size = unsafe { u.hvm_context }.size as usize;

        let mut blob = vec![0u8; size];

        with_locked_slice(&mut blob, |addr| {
            let u = XenDomctlPayload {
                hvm_context: XenDomctlHvmContext {
                    size: size as u32,
                    _pad: 0,
                    buffer: addr,
                },
            };

            self.domctl(XEN_DOMCTL_GETHVMCONTEXT, domid, u).map(drop)
        })??;

        Ok(blob)
    }

    /// Replaces the full HVM save context blob of the domain.
    pub fn set_hvm_context(&self, domid: u32, blob: &[u8]) -> crate::Result<()> {
        let mut blob = blob.to_vec();
        let size = blob.len() as u32;

        with_locked_slice(&mut blob, |addr| {
            let u = XenDomctlPayload {
                hvm_context: XenDomctlHvmContext {
                    size,
                    _pad: 0,
                    buffer: addr,
                },
            };

            self.domctl(XEN_DOMCTL_SETHVMCONTEXT, domid, u).map(drop)
        })?
    }

    /// Highest guest page frame number of the domain.
    pub fn maximum_gpfn(&self, domid: u32) -> crate::Result<u64> {
        let mut dom: u16 = domid as u16;

        let gpfn = with_locked(&mut dom, |addr| {
            self.hypercall(HYPERVISOR_MEMORY_OP, [XENMEM_MAXIMUM_GPFN, addr, 0, 0, 0])
        })??;

        Ok(gpfn as u64)
    }
}

/// Page-locks `buf` for the duration of `f`, handing it the buffer
/// address.
fn with_locked<T, R>(buf: &mut T, f: impl FnOnce(u64) -> R) -> crate::Result<R> {
    let ptr = (buf as *mut T).cast::<libc::c_void>();
    let len = mem::size_of::<T>();

    lock_range(ptr, len, f)
}

/// Page-locks a byte buffer for the duration of `f`.
fn with_locked_slice<R>(buf: &mut [u8], f: impl FnOnce(u64) -> R) -> crate::Result<R> {
    let len = buf.len();

    lock_range(buf.as_mut_ptr().cast(), len, f)
}

fn lock_range<R>(ptr: *mut libc::c_void, len: usize, f: impl FnOnce(u64) -> R) -> crate::Result<R> {
    if len > 0 {
        unsafe { Errno::result(libc::mlock(ptr, len)) }.map_err(Error::Os)?;
    }

    let res = f(ptr as u64);

    if len > 0 {
        unsafe { libc::munlock(ptr, len) };
    }

    Ok(res)
}
