use std::fmt::Write;

use domdbg_core::regs::{CpuContext, RegisterInfo, RegistersX86, RegistersX86_64};

use crate::error::Error;
use crate::hex;

/// Encoding options of the response codec.
#[derive(Copy, Clone, Debug)]
pub struct Encoding {
    /// Narrow the 64-bit flags register to its low 32 bits in the batch
    /// register dump.
    ///
    /// GDB requires the narrowing; clients accepting a 64-bit flags field
    /// can turn it off.
    pub narrow_rflags: bool,
}

impl Default for Encoding {
    fn default() -> Self {
        Self {
            narrow_rflags: true,
        }
    }
}

/// Response packet sent to the remote client.
#[derive(Clone, Debug)]
pub enum Response {
    /// Literal `OK`.
    Ok,

    /// Empty payload, the reply to unrecognised packets.
    NotSupported,

    /// `E` followed by two hex digits of the error code.
    Error(u8),

    /// Supported features, joined by `;`.
    QuerySupported(Vec<String>),

    /// `QC` + the current thread ID (`-1` means all threads, 0 any
    /// thread).
    QueryCurrentThreadId(i64),

    /// `m` + comma-separated hex thread IDs + trailing `l`.
    ///
    /// Encoding an empty list is an error.
    QueryThreadInfo(Vec<u64>),

    /// Literal `l`, the end of the thread list.
    QueryThreadInfoEnd,

    /// A single register value, `width` bytes in guest order.
    RegisterRead {
        /// Register value, zero-extended.
        value: u64,
        /// Register width in bytes.
        width: usize,
    },

    /// Fixed-order concatenation of the general-purpose registers.
    GeneralRegisters(CpuContext),

    /// Guest memory bytes, two hex digits each.
    MemoryRead(Vec<u8>),

    /// `T ` + two hex digits of the signal number.
    ///
    /// The space is required when operating in acknowledgement mode.
    StopReasonSignal(u8),

    /// Host description as `key:value;` pairs.
    QueryHostInfo {
        /// Guest pointer width in bytes (4 or 8).
        word_size: usize,
        /// Hostname reported to the client.
        hostname: String,
    },

    /// Debuggee description as `key:value;` pairs.
    QueryProcessInfo {
        /// Process ID reported to the client (the domain ID).
        pid: u32,
    },

    /// Register description as `key:value;` pairs.
    QueryRegisterInfo(RegisterInfo),
}

impl Response {
    /// Encodes the response into its textual payload.
    ///
    /// Deterministic: identical inputs yield identical output. Nothing is
    /// emitted when an error is returned.
    pub fn encode(&self, enc: &Encoding) -> Result<String, Error> {
        let mut out = String::new();

        match self {
            Self::Ok => out.push_str("OK"),

            Self::NotSupported => {}

            Self::Error(code) => {
                let _ = write!(out, "E{code:02x}");
            }

            Self::QuerySupported(features) => out.push_str(&features.join(";")),

            Self::QueryCurrentThreadId(tid) => {
                out.push_str("QC");
                if *tid == -1 {
                    out.push_str("-1");
                } else {
                    let _ = write!(out, "{tid:x}");
                }
            }

            Self::QueryThreadInfo(tids) => {
                let (first, rest) = tids.split_first().ok_or(Error::EmptyThreadList)?;

                let _ = write!(out, "m{first:x}");
                for tid in rest {
                    let _ = write!(out, ",{tid:x}");
                }
                out.push('l');
            }

            Self::QueryThreadInfoEnd => out.push('l'),

            Self::RegisterRead { value, width } => hex::push_value(&mut out, *value, *width),

            Self::GeneralRegisters(ctx) => match ctx {
                CpuContext::B32(regs) => encode_regs32(&mut out, regs),
                CpuContext::B64(regs) => encode_regs64(&mut out, regs, enc),
            },

            Self::MemoryRead(bytes) => hex::push_bytes(&mut out, bytes),

            Self::StopReasonSignal(signal) => {
                let _ = write!(out, "T {signal:02x}");
            }

            Self::QueryHostInfo {
                word_size,
                hostname,
            } => {
                if !matches!(word_size, 4 | 8) {
                    return Err(Error::WordSize(*word_size));
                }

                let _ = write!(
                    out,
                    "ostype:linux;endian:little;ptrsize:{word_size};hostname:{hostname};"
                );
            }

            Self::QueryProcessInfo { pid } => {
                let _ = write!(out, "pid:{pid:x};");
            }

            Self::QueryRegisterInfo(info) => {
                let _ = write!(
                    out,
                    "name:{};bitsize:{};offset:{};encoding:uint;format:hex;\
                     set:General Purpose Registers;gcc:{};dwarf:{};",
                    info.name, info.bitsize, info.offset, info.gcc_id, info.gcc_id
                );
            }
        }

        Ok(out)
    }
}

fn encode_regs32(out: &mut String, regs: &RegistersX86) {
    for value in [
        regs.eax, regs.ecx, regs.edx, regs.ebx, regs.esp, regs.ebp, regs.esi, regs.edi, regs.eip,
        regs.eflags, regs.cs, regs.ss, regs.ds, regs.es, regs.fs, regs.gs,
    ] {
        hex::push_value(out, value as u64, 4);
    }
}

fn encode_regs64(out: &mut String, regs: &RegistersX86_64, enc: &Encoding) {
    for value in [
        regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rbp, regs.rsp, regs.r8,
        regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15, regs.rip,
    ] {
        hex::push_value(out, value, 8);
    }

    if enc.narrow_rflags {
        hex::push_value(out, regs.rflags & 0xffff_ffff, 4);
    } else {
        hex::push_value(out, regs.rflags, 8);
    }

    for value in [regs.cs, regs.ss, regs.ds, regs.es, regs.fs, regs.gs] {
        hex::push_value(out, value as u64, 4);
    }
}

#[cfg(test)]
mod tests {
    use domdbg_core::regs::REGS64_INFO;

    use super::*;

    fn encode(response: &Response) -> String {
        response.encode(&Encoding::default()).unwrap()
    }

    #[test]
    fn simple_shapes() {
        assert_eq!(encode(&Response::Ok), "OK");
        assert_eq!(encode(&Response::NotSupported), "");
        assert_eq!(encode(&Response::Error(0x45)), "E45");
        assert_eq!(encode(&Response::QueryThreadInfoEnd), "l");
        assert_eq!(encode(&Response::StopReasonSignal(5)), "T 05");
    }

    #[test]
    fn supported_features_are_joined() {
        assert_eq!(encode(&Response::QuerySupported(Vec::new())), "");
        assert_eq!(
            encode(&Response::QuerySupported(vec![
                "PacketSize=1000".into(),
                "QStartNoAckMode+".into()
            ])),
            "PacketSize=1000;QStartNoAckMode+"
        );
    }

    #[test]
    fn current_thread_id_shapes() {
        assert_eq!(encode(&Response::QueryCurrentThreadId(-1)), "QC-1");
        assert_eq!(encode(&Response::QueryCurrentThreadId(0)), "QC0");
        assert_eq!(encode(&Response::QueryCurrentThreadId(0x1a)), "QC1a");
    }

    #[test]
    fn thread_info_lists_ids() {
        assert_eq!(encode(&Response::QueryThreadInfo(vec![1])), "m1l");
        assert_eq!(
            encode(&Response::QueryThreadInfo(vec![1, 2, 0x10])),
            "m1,2,10l"
        );
    }

    #[test]
    fn empty_thread_info_fails_before_any_output() {
        let res = Response::QueryThreadInfo(Vec::new()).encode(&Encoding::default());
        assert!(matches!(res, Err(Error::EmptyThreadList)));
    }

    #[test]
    fn register_read_uses_guest_byte_order() {
        assert_eq!(
            encode(&Response::RegisterRead {
                value: 0x0102_0304,
                width: 4
            }),
            "04030201"
        );
        assert_eq!(
            encode(&Response::RegisterRead {
                value: 0x1234,
                width: 8
            }),
            "3412000000000000"
        );
    }

    #[test]
    fn memory_read_is_plain_hex_pairs() {
        assert_eq!(
            encode(&Response::MemoryRead(vec![0xde, 0xad, 0x00, 0x01])),
            "dead0001"
        );
    }

    #[test]
    fn general_registers_batch_32bit() {
        let regs = RegistersX86 {
            eax: 1,
            ecx: 2,
            edx: 3,
            ebx: 4,
            esp: 5,
            ebp: 6,
            esi: 7,
            edi: 8,
            eip: 9,
            eflags: 0x202,
            cs: 0x10,
            ss: 0x11,
            ds: 0x12,
            es: 0x13,
            fs: 0x14,
            gs: 0x15,
        };

        let payload = encode(&Response::GeneralRegisters(CpuContext::B32(regs)));

        assert_eq!(
            payload,
            concat!(
                "01000000", "02000000", "03000000", "04000000", // eax ecx edx ebx
                "05000000", "06000000", "07000000", "08000000", // esp ebp esi edi
                "09000000", "02020000", // eip eflags
                "10000000", "11000000", "12000000", // cs ss ds
                "13000000", "14000000", "15000000", // es fs gs
            )
        );
    }

    #[test]
    fn general_registers_batch_64bit_narrows_rflags() {
        let regs = RegistersX86_64 {
            rip: 0x1234,
            rflags: 0x1_0000_0202,
            cs: 0x33,
            ..Default::default()
        };

        let payload = encode(&Response::GeneralRegisters(CpuContext::B64(regs)));

        // 16 GPRs + rip at 16 hex digits each, narrowed rflags, 6 segments
        assert_eq!(payload.len(), 17 * 16 + 8 + 6 * 8);
        assert_eq!(&payload[256..272], "3412000000000000"); // rip
        assert_eq!(&payload[272..280], "02020000"); // low 32 bits of rflags
        assert_eq!(&payload[280..288], "33000000"); // cs
    }

    #[test]
    fn general_registers_batch_64bit_wide_rflags() {
        let regs = RegistersX86_64 {
            rflags: 0x1_0000_0202,
            ..Default::default()
        };

        let enc = Encoding {
            narrow_rflags: false,
        };
        let payload = Response::GeneralRegisters(CpuContext::B64(regs))
            .encode(&enc)
            .unwrap();

        assert_eq!(payload.len(), 17 * 16 + 16 + 6 * 8);
        assert_eq!(&payload[272..288], "0202000001000000");
    }

    #[test]
    fn host_info_shape() {
        assert_eq!(
            encode(&Response::QueryHostInfo {
                word_size: 8,
                hostname: "dom0".into()
            }),
            "ostype:linux;endian:little;ptrsize:8;hostname:dom0;"
        );
    }

    #[test]
    fn host_info_rejects_bad_word_size() {
        let res = Response::QueryHostInfo {
            word_size: 2,
            hostname: "dom0".into(),
        }
        .encode(&Encoding::default());

        assert!(matches!(res, Err(Error::WordSize(2))));
    }

    #[test]
    fn process_info_shape() {
        assert_eq!(
            encode(&Response::QueryProcessInfo { pid: 0x2a }),
            "pid:2a;"
        );
    }

    #[test]
    fn register_info_shape() {
        // rip
        assert_eq!(
            encode(&Response::QueryRegisterInfo(REGS64_INFO[16])),
            "name:rip;bitsize:64;offset:128;encoding:uint;format:hex;\
             set:General Purpose Registers;gcc:16;dwarf:16;"
        );
    }

    #[test]
    fn encoding_is_deterministic() {
        let response = Response::GeneralRegisters(CpuContext::B64(RegistersX86_64 {
            rax: 0xdead_beef,
            rflags: 0x202,
            ..Default::default()
        }));

        assert_eq!(encode(&response), encode(&response));
    }
}
