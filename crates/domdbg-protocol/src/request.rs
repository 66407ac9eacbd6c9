use crate::error::Error;
use crate::hex;

/// Request packet from the remote client, with framing already stripped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// `qSupported`: feature negotiation.
    QuerySupported(Vec<String>),

    /// `qHostInfo`: host description.
    QueryHostInfo,

    /// `qProcessInfo`: debuggee description.
    QueryProcessInfo,

    /// `qRegisterInfo<id>`: register description.
    QueryRegisterInfo(u16),

    /// `qC`: current thread ID.
    QueryCurrentThread,

    /// `qfThreadInfo`: first chunk of the thread list.
    QueryThreadInfoFirst,

    /// `qsThreadInfo`: next chunk of the thread list.
    QueryThreadInfoNext,

    /// `QStartNoAckMode`: stop exchanging acknowledgement bytes.
    StartNoAckMode,

    /// `?`: reason the debuggee stopped.
    StopReason,

    /// `g`: batch read of the general-purpose registers.
    ReadGeneralRegisters,

    /// `p<id>`: read of a single register.
    ReadRegister(u16),

    /// `P<id>=<bytes>`: write of a single register, bytes in guest order.
    WriteRegister {
        /// Client register number.
        id: u16,
        /// Raw register bytes, in guest byte order.
        bytes: Vec<u8>,
    },

    /// `m<addr>,<len>`: guest memory read.
    ReadMemory {
        /// Guest virtual address.
        addr: u64,
        /// Number of bytes to read.
        len: usize,
    },

    /// `M<addr>,<len>:<bytes>`: guest memory write.
    WriteMemory {
        /// Guest virtual address.
        addr: u64,
        /// Decoded bytes to write.
        data: Vec<u8>,
    },

    /// `c`: continue the guest.
    Continue,

    /// `s`: execute one instruction.
    Step,

    /// `Z0,<addr>,<kind>`: plant a software breakpoint.
    InsertBreakpoint {
        /// Guest virtual address.
        addr: u64,
    },

    /// `z0,<addr>,<kind>`: remove a software breakpoint.
    RemoveBreakpoint {
        /// Guest virtual address.
        addr: u64,
    },

    /// `D`: detach from the debuggee.
    Detach,

    /// `k`: kill the debuggee (treated as detach).
    Kill,

    /// Any packet kind the codec does not model.
    Unknown(String),
}

impl Request {
    /// Parses one unframed packet payload.
    ///
    /// Unrecognised packet kinds yield [Request::Unknown]; malformed
    /// payloads of recognised kinds are errors.
    pub fn parse(payload: &str) -> Result<Self, Error> {
        let request = match payload {
            "qHostInfo" => Self::QueryHostInfo,
            "qProcessInfo" => Self::QueryProcessInfo,
            "qC" => Self::QueryCurrentThread,
            "qfThreadInfo" => Self::QueryThreadInfoFirst,
            "qsThreadInfo" => Self::QueryThreadInfoNext,
            "QStartNoAckMode" => Self::StartNoAckMode,
            "?" => Self::StopReason,
            "g" => Self::ReadGeneralRegisters,
            "c" => Self::Continue,
            "s" => Self::Step,
            "D" => Self::Detach,
            "k" => Self::Kill,
            _ => return Self::parse_prefixed(payload),
        };

        Ok(request)
    }

    fn parse_prefixed(payload: &str) -> Result<Self, Error> {
        if payload == "qSupported" {
            return Ok(Self::QuerySupported(Vec::new()));
        }

        if let Some(features) = payload.strip_prefix("qSupported:") {
            let features = features.split(';').map(str::to_owned).collect();
            return Ok(Self::QuerySupported(features));
        }

        if let Some(id) = payload.strip_prefix("qRegisterInfo") {
            return Ok(Self::QueryRegisterInfo(hex::parse_u64(id)? as u16));
        }

        if let Some(rest) = payload.strip_prefix('p') {
            return Ok(Self::ReadRegister(hex::parse_u64(rest)? as u16));
        }

        if let Some(rest) = payload.strip_prefix('P') {
            let (id, bytes) = rest
                .split_once('=')
                .ok_or(Error::Malformed("register write without '='"))?;

            return Ok(Self::WriteRegister {
                id: hex::parse_u64(id)? as u16,
                bytes: hex::decode_bytes(bytes)?,
            });
        }

        if let Some(rest) = payload.strip_prefix('m') {
            let (addr, len) = rest
                .split_once(',')
                .ok_or(Error::Malformed("memory read without ','"))?;

            return Ok(Self::ReadMemory {
                addr: hex::parse_u64(addr)?,
                len: hex::parse_u64(len)? as usize,
            });
        }

        if let Some(rest) = payload.strip_prefix('M') {
            let (range, data) = rest
                .split_once(':')
                .ok_or(Error::Malformed("memory write without ':'"))?;
            let (addr, len) = range
                .split_once(',')
                .ok_or(Error::Malformed("memory write without ','"))?;

            let len = hex::parse_u64(len)? as usize;
            let data = hex::decode_bytes(data)?;

            if data.len() != len {
                return Err(Error::PacketSize {
                    actual: data.len(),
                    expected: len,
                });
            }

            return Ok(Self::WriteMemory {
                addr: hex::parse_u64(addr)?,
                data,
            });
        }

        if let Some(rest) = payload.strip_prefix("Z0,") {
            return Ok(Self::InsertBreakpoint {
                addr: Self::parse_breakpoint_addr(rest)?,
            });
        }

        if let Some(rest) = payload.strip_prefix("z0,") {
            return Ok(Self::RemoveBreakpoint {
                addr: Self::parse_breakpoint_addr(rest)?,
            });
        }

        Ok(Self::Unknown(payload.to_owned()))
    }

    fn parse_breakpoint_addr(rest: &str) -> Result<u64, Error> {
        let (addr, _kind) = rest
            .split_once(',')
            .ok_or(Error::Malformed("breakpoint packet without kind"))?;

        hex::parse_u64(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_kinds() {
        assert_eq!(Request::parse("qC").unwrap(), Request::QueryCurrentThread);
        assert_eq!(Request::parse("?").unwrap(), Request::StopReason);
        assert_eq!(
            Request::parse("g").unwrap(),
            Request::ReadGeneralRegisters
        );
        assert_eq!(Request::parse("c").unwrap(), Request::Continue);
        assert_eq!(Request::parse("s").unwrap(), Request::Step);
    }

    #[test]
    fn parses_supported_features() {
        assert_eq!(
            Request::parse("qSupported").unwrap(),
            Request::QuerySupported(Vec::new())
        );
        assert_eq!(
            Request::parse("qSupported:multiprocess+;swbreak+").unwrap(),
            Request::QuerySupported(vec!["multiprocess+".into(), "swbreak+".into()])
        );
    }

    #[test]
    fn parses_memory_accesses() {
        assert_eq!(
            Request::parse("m1000,20").unwrap(),
            Request::ReadMemory {
                addr: 0x1000,
                len: 0x20
            }
        );
        assert_eq!(
            Request::parse("M2000,3:aabbcc").unwrap(),
            Request::WriteMemory {
                addr: 0x2000,
                data: vec![0xaa, 0xbb, 0xcc]
            }
        );
    }

    #[test]
    fn memory_write_length_mismatch_is_rejected() {
        assert!(matches!(
            Request::parse("M2000,4:aabbcc"),
            Err(Error::PacketSize {
                actual: 3,
                expected: 4
            })
        ));
    }

    #[test]
    fn parses_register_accesses() {
        assert_eq!(Request::parse("p10").unwrap(), Request::ReadRegister(0x10));
        assert_eq!(
            Request::parse("P0=0102030405060708").unwrap(),
            Request::WriteRegister {
                id: 0,
                bytes: vec![1, 2, 3, 4, 5, 6, 7, 8]
            }
        );
    }

    #[test]
    fn parses_breakpoint_packets() {
        assert_eq!(
            Request::parse("Z0,40123f,2").unwrap(),
            Request::InsertBreakpoint { addr: 0x40123f }
        );
        assert_eq!(
            Request::parse("z0,40123f,2").unwrap(),
            Request::RemoveBreakpoint { addr: 0x40123f }
        );
    }

    #[test]
    fn unknown_kinds_are_preserved() {
        assert_eq!(
            Request::parse("qXfer:features:read").unwrap(),
            Request::Unknown("qXfer:features:read".into())
        );
        // hardware breakpoints are not modeled
        assert_eq!(
            Request::parse("Z1,1000,2").unwrap(),
            Request::Unknown("Z1,1000,2".into())
        );
    }
}
