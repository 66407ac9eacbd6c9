//! Guest CPU context ABI structures and their conversions.
//!
//! Layouts follow the Xen public headers (`arch-x86/xen-x86_32.h`,
//! `arch-x86/xen-x86_64.h`, `arch-x86/hvm/save.h`). A paravirtual
//! guest's context is served in its own ABI, so both the native and the
//! compat layout are defined.

use domdbg_core::domain::WordSize;
use domdbg_core::regs::{CpuContext, RegistersX86, RegistersX86_64};

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct TrapInfo32 {
    pub vector: u8,
    pub flags: u8,
    pub cs: u16,
    pub address: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct TrapInfo64 {
    pub vector: u8,
    pub flags: u8,
    pub cs: u16,
    pub _pad: u32,
    pub address: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct CpuUserRegs32 {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub error_code: u16,
    pub entry_vector: u16,
    pub eip: u32,
    pub cs: u16,
    pub saved_upcall_mask: u8,
    pub _pad0: u8,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    pub _pad1: u16,
    pub es: u16,
    pub _pad2: u16,
    pub ds: u16,
    pub _pad3: u16,
    pub fs: u16,
    pub _pad4: u16,
    pub gs: u16,
    pub _pad5: u16,
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct CpuUserRegs64 {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub error_code: u32,
    pub entry_vector: u32,
    pub rip: u64,
    pub cs: u16,
    pub _pad0: u16,
    pub saved_upcall_mask: u8,
    pub _pad1: [u8; 3],
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u16,
    pub _pad2: [u16; 3],
    pub es: u16,
    pub _pad3: [u16; 3],
    pub ds: u16,
    pub _pad4: [u16; 3],
    pub fs: u16,
    pub _pad5: [u16; 3],
    pub gs: u16,
    pub _pad6: [u16; 3],
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct VcpuGuestContext32 {
    pub fpu_ctxt: [u8; 512],
    pub flags: u32,
    pub user_regs: CpuUserRegs32,
    pub trap_ctxt: [TrapInfo32; 256],
    pub ldt_base: u32,
    pub ldt_ents: u32,
    pub gdt_frames: [u32; 16],
    pub gdt_ents: u32,
    pub kernel_ss: u32,
    pub kernel_sp: u32,
    pub ctrlreg: [u32; 8],
    pub debugreg: [u32; 8],
    pub event_callback_cs: u32,
    pub event_callback_eip: u32,
    pub failsafe_callback_cs: u32,
    pub failsafe_callback_eip: u32,
    pub vm_assist: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct VcpuGuestContext64 {
    pub fpu_ctxt: [u8; 512],
    pub flags: u64,
    pub user_regs: CpuUserRegs64,
    pub trap_ctxt: [TrapInfo64; 256],
    pub ldt_base: u64,
    pub ldt_ents: u64,
    pub gdt_frames: [u64; 16],
    pub gdt_ents: u64,
    pub kernel_ss: u64,
    pub kernel_sp: u64,
    pub ctrlreg: [u64; 8],
    pub debugreg: [u64; 8],
    pub event_callback_eip: u64,
    pub failsafe_callback_eip: u64,
    pub syscall_callback_eip: u64,
    pub vm_assist: u64,
    pub fs_base: u64,
    pub gs_base_kernel: u64,
    pub gs_base_user: u64,
}

/// Guest context in either ABI; the guest's word size selects the view.
#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub union VcpuGuestContextAny {
    pub b32: VcpuGuestContext32,
    pub b64: VcpuGuestContext64,
}

impl VcpuGuestContextAny {
    /// Reads the general-purpose register file out of the context.
    pub fn to_cpu_context(&self, word_size: WordSize) -> CpuContext {
        match word_size {
            WordSize::Four => {
                let regs = unsafe { &self.b32.user_regs };

                CpuContext::B32(RegistersX86 {
                    eax: regs.eax,
                    ebx: regs.ebx,
                    ecx: regs.ecx,
                    edx: regs.edx,
                    esi: regs.esi,
                    edi: regs.edi,
                    ebp: regs.ebp,
                    esp: regs.esp,
                    eip: regs.eip,
                    eflags: regs.eflags,
                    cs: regs.cs as u32,
                    ss: regs.ss as u32,
                    ds: regs.ds as u32,
                    es: regs.es as u32,
                    fs: regs.fs as u32,
                    gs: regs.gs as u32,
                })
            }
            WordSize::Eight => {
                let regs = unsafe { &self.b64.user_regs };

                CpuContext::B64(RegistersX86_64 {
                    rax: regs.rax,
                    rbx: regs.rbx,
                    rcx: regs.rcx,
                    rdx: regs.rdx,
                    rsi: regs.rsi,
                    rdi: regs.rdi,
                    rbp: regs.rbp,
                    rsp: regs.rsp,
                    r8: regs.r8,
                    r9: regs.r9,
                    r10: regs.r10,
                    r11: regs.r11,
                    r12: regs.r12,
                    r13: regs.r13,
                    r14: regs.r14,
                    r15: regs.r15,
                    rip: regs.rip,
                    rflags: regs.rflags,
                    cs: regs.cs as u32,
                    ss: regs.ss as u32,
                    ds: regs.ds as u32,
                    es: regs.es as u32,
                    fs: regs.fs as u32,
                    gs: regs.gs as u32,
                })
            }
        }
    }

    /// Overlays a register file onto the fetched context, leaving every
    /// other field untouched.
    pub fn apply_cpu_context(&mut self, ctx: &CpuContext) {
        match ctx {
            CpuContext::B32(new) => {
                let regs = unsafe { &mut self.b32.user_regs };

                regs.eax = new.eax;
                regs.ebx = new.ebx;
                regs.ecx = new.ecx;
                regs.edx = new.edx;
                regs.esi = new.esi;
                regs.edi = new.edi;
                regs.ebp = new.ebp;
                regs.esp = new.esp;
                regs.eip = new.eip;
                regs.eflags = new.eflags;
                regs.cs = new.cs as u16;
                regs.ss = new.ss as u16;
                regs.ds = new.ds as u16;
                regs.es = new.es as u16;
                regs.fs = new.fs as u16;
                regs.gs = new.gs as u16;
            }
            CpuContext::B64(new) => {
                let regs = unsafe { &mut self.b64.user_regs };

                regs.rax = new.rax;
                regs.rbx = new.rbx;
                regs.rcx = new.rcx;
                regs.rdx = new.rdx;
                regs.rsi = new.rsi;
                regs.rdi = new.rdi;
                regs.rbp = new.rbp;
                regs.rsp = new.rsp;
                regs.r8 = new.r8;
                regs.r9 = new.r9;
                regs.r10 = new.r10;
                regs.r11 = new.r11;
                regs.r12 = new.r12;
                regs.r13 = new.r13;
                regs.r14 = new.r14;
                regs.r15 = new.r15;
                regs.rip = new.rip;
                regs.rflags = new.rflags;
                regs.cs = new.cs as u16;
                regs.ss = new.ss as u16;
                regs.ds = new.ds as u16;
                regs.es = new.es as u16;
                regs.fs = new.fs as u16;
                regs.gs = new.gs as u16;
            }
        }
    }
}

/// CPU record of the HVM save context (`HVM_SAVE_CODE(CPU)`).
#[repr(C)]
#[derive(Copy, Clone)]
#[allow(missing_docs)]
pub struct HvmHwCpu {
    pub fpu_regs: [u8; 512],
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub cs_sel: u32,
    pub ds_sel: u32,
    pub es_sel: u32,
    pub fs_sel: u32,
    pub gs_sel: u32,
    pub ss_sel: u32,
    pub tr_sel: u32,
    pub ldtr_sel: u32,
    pub cs_limit: u32,
    pub ds_limit: u32,
    pub es_limit: u32,
    pub fs_limit: u32,
    pub gs_limit: u32,
    pub ss_limit: u32,
    pub tr_limit: u32,
    pub ldtr_limit: u32,
    pub idtr_limit: u32,
    pub gdtr_limit: u32,
    pub cs_base: u64,
    pub ds_base: u64,
    pub es_base: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ss_base: u64,
    pub tr_base: u64,
    pub ldtr_base: u64,
    pub idtr_base: u64,
    pub gdtr_base: u64,
    pub cs_arbytes: u32,
    pub ds_arbytes: u32,
    pub es_arbytes: u32,
    pub fs_arbytes: u32,
    pub gs_arbytes: u32,
    pub ss_arbytes: u32,
    pub tr_arbytes: u32,
    pub ldtr_arbytes: u32,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub shadow_gs: u64,
    pub msr_flags: u64,
    pub msr_lstar: u64,
    pub msr_star: u64,
    pub msr_cstar: u64,
    pub msr_syscall_mask: u64,
    pub msr_efer: u64,
    pub msr_tsc_aux: u64,
    pub tsc: u64,
    pub pending_event: u32,
    pub error_code: u32,
}

impl HvmHwCpu {
    /// Reads the general-purpose register file out of the record.
    pub fn to_cpu_context(&self, word_size: WordSize) -> CpuContext {
        match word_size {
            WordSize::Four => CpuContext::B32(RegistersX86 {
                eax: self.rax as u32,
                ebx: self.rbx as u32,
                ecx: self.rcx as u32,
                edx: self.rdx as u32,
                esi: self.rsi as u32,
                edi: self.rdi as u32,
                ebp: self.rbp as u32,
                esp: self.rsp as u32,
                eip: self.rip as u32,
                eflags: self.rflags as u32,
                cs: self.cs_sel,
                ss: self.ss_sel,
                ds: self.ds_sel,
                es: self.es_sel,
                fs: self.fs_sel,
                gs: self.gs_sel,
            }),
            WordSize::Eight => CpuContext::B64(RegistersX86_64 {
                rax: self.rax,
                rbx: self.rbx,
                rcx: self.rcx,
                rdx: self.rdx,
                rsi: self.rsi,
                rdi: self.rdi,
                rbp: self.rbp,
                rsp: self.rsp,
                r8: self.r8,
                r9: self.r9,
                r10: self.r10,
                r11: self.r11,
                r12: self.r12,
                r13: self.r13,
                r14: self.r14,
                r15: self.r15,
                rip: self.rip,
                rflags: self.rflags,
                cs: self.cs_sel,
                ss: self.ss_sel,
                ds: self.ds_sel,
                es: self.es_sel,
                fs: self.fs_sel,
                gs: self.gs_sel,
            }),
        }
    }

    /// Overlays a register file onto the record.
    pub fn apply_cpu_context(&mut self, ctx: &CpuContext) {
        match ctx {
            CpuContext::B32(new) => {
                self.rax = new.eax as u64;
                self.rbx = new.ebx as u64;
                self.rcx = new.ecx as u64;
                self.rdx = new.edx as u64;
                self.rsi = new.esi as u64;
                self.rdi = new.edi as u64;
                self.rbp = new.ebp as u64;
                self.rsp = new.esp as u64;
                self.rip = new.eip as u64;
                self.rflags = new.eflags as u64;
                self.cs_sel = new.cs;
                self.ss_sel = new.ss;
                self.ds_sel = new.ds;
                self.es_sel = new.es;
                self.fs_sel = new.fs;
                self.gs_sel = new.gs;
            }
            CpuContext::B64(new) => {
                self.rax = new.rax;
                self.rbx = new.rbx;
                self.rcx = new.rcx;
                self.rdx = new.rdx;
                self.rsi = new.rsi;
                self.rdi = new.rdi;
                self.rbp = new.rbp;
                self.rsp = new.rsp;
                self.r8 = new.r8;
                self.r9 = new.r9;
                self.r10 = new.r10;
                self.r11 = new.r11;
                self.r12 = new.r12;
                self.r13 = new.r13;
                self.r14 = new.r14;
                self.r15 = new.r15;
                self.rip = new.rip;
                self.rflags = new.rflags;
                self.cs_sel = new.cs;
                self.ss_sel = new.ss;
                self.ds_sel = new.ds;
                self.es_sel = new.es;
                self.fs_sel = new.fs;
                self.gs_sel = new.gs;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pv_context_round_trip_64bit() {
        let mut any: VcpuGuestContextAny = unsafe { std::mem::zeroed() };

        let ctx = CpuContext::B64(RegistersX86_64 {
            rax: 1,
            rsp: 0x7000,
            rip: 0x401000,
            rflags: 0x202,
            cs: 0xe033,
            ..Default::default()
        });

        any.apply_cpu_context(&ctx);
        assert_eq!(any.to_cpu_context(WordSize::Eight), ctx);
    }

    #[test]
    fn hvm_record_truncates_for_32bit_guests() {
        let mut cpu: HvmHwCpu = unsafe { std::mem::zeroed() };
        cpu.rax = 0x1_0000_0001;
        cpu.rip = 0x401000;
        cpu.cs_sel = 0x8;

        let ctx = cpu.to_cpu_context(WordSize::Four);
        assert_eq!(ctx.read_by_name("eax"), Some(1));
        assert_eq!(ctx.instr_ptr(), 0x401000);
    }
}
