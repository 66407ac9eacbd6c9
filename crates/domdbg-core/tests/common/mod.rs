#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use domdbg_core::domain::{Domain, MapProt, MemoryWindow, VcpuId, WordSize};
use domdbg_core::regs::{CpuContext, RegistersX86, RegistersX86_64};

/// Error type of the mock backend.
#[derive(thiserror::Error, Debug)]
pub enum MockError {
    #[error("unmapped guest address: {0:#x}")]
    Unmapped(u64),
}

struct MockState {
    base: u64,
    mem: Vec<u8>,
    ctx: CpuContext,
    paused: bool,

    /// Program-counter values the "guest" lands on, one per unpause.
    stops: VecDeque<u64>,
}

/// In-memory guest domain driven by the engine tests.
///
/// Cloning yields another handle over the same guest state.
#[derive(Clone)]
pub struct MockDomain {
    state: Rc<RefCell<MockState>>,
    word_size: WordSize,
}

impl MockDomain {
    pub fn new(base: u64, size: usize, word_size: WordSize) -> Self {
        let ctx = match word_size {
            WordSize::Four => CpuContext::B32(RegistersX86 {
                eip: base as u32,
                ..Default::default()
            }),
            WordSize::Eight => CpuContext::B64(RegistersX86_64 {
                rip: base,
                ..Default::default()
            }),
        };

        Self {
            state: Rc::new(RefCell::new(MockState {
                base,
                mem: vec![0; size],
                ctx,
                paused: false,
                stops: VecDeque::new(),
            })),
            word_size,
        }
    }

    /// Copies bytes into guest memory.
    pub fn load(&self, addr: u64, bytes: &[u8]) {
        let mut st = self.state.borrow_mut();
        let off = (addr - st.base) as usize;
        st.mem[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads guest memory directly, bypassing the engine.
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let st = self.state.borrow();
        let off = (addr - st.base) as usize;
        st.mem[off..off + len].to_vec()
    }

    /// Moves the guest program counter.
    pub fn set_ip(&self, ip: u64) {
        set_ip(&mut self.state.borrow_mut().ctx, ip);
    }

    /// Schedules the program-counter value the guest reaches at its next
    /// unpause.
    pub fn queue_stop(&self, ip: u64) {
        self.state.borrow_mut().stops.push_back(ip);
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    /// Rewrites the register file of the mock guest.
    pub fn with_context(&self, f: impl FnOnce(&mut CpuContext)) {
        f(&mut self.state.borrow_mut().ctx);
    }
}

impl Domain for MockDomain {
    type Window = MockWindow;
    type Error = MockError;

    fn id(&self) -> u32 {
        7
    }

    fn word_size(&self) -> WordSize {
        self.word_size
    }

    fn vcpu_count(&self) -> u32 {
        1
    }

    fn pause(&self) -> Result<(), MockError> {
        self.state.borrow_mut().paused = true;
        Ok(())
    }

    fn unpause(&self) -> Result<(), MockError> {
        let mut st = self.state.borrow_mut();
        st.paused = false;

        if let Some(ip) = st.stops.pop_front() {
            set_ip(&mut st.ctx, ip);
        }

        Ok(())
    }

    fn get_cpu_context(&self, _vcpu: VcpuId) -> Result<CpuContext, MockError> {
        Ok(self.state.borrow().ctx)
    }

    fn set_cpu_context(&self, _vcpu: VcpuId, ctx: &CpuContext) -> Result<(), MockError> {
        self.state.borrow_mut().ctx = *ctx;
        Ok(())
    }

    fn set_debugging(&self, _enable: bool) -> Result<(), MockError> {
        Ok(())
    }

    fn map_memory(&self, addr: u64, len: usize, prot: MapProt) -> Result<MockWindow, MockError> {
        let st = self.state.borrow();

        let start = addr.checked_sub(st.base).ok_or(MockError::Unmapped(addr))? as usize;
        let end = start.checked_add(len).ok_or(MockError::Unmapped(addr))?;

        if end > st.mem.len() {
            return Err(MockError::Unmapped(addr));
        }

        Ok(MockWindow {
            state: Rc::clone(&self.state),
            addr,
            buf: st.mem[start..end].to_vec(),
            writable: prot.writable(),
        })
    }
}

/// Window over the mock guest memory; writes flush back on drop.
pub struct MockWindow {
    state: Rc<RefCell<MockState>>,
    addr: u64,
    buf: Vec<u8>,
    writable: bool,
}

impl Deref for MockWindow {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for MockWindow {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl MemoryWindow for MockWindow {}

impl Drop for MockWindow {
    fn drop(&mut self) {
        if !self.writable {
            return;
        }

        let mut st = self.state.borrow_mut();
        let off = (self.addr - st.base) as usize;
        let len = self.buf.len();
        st.mem[off..off + len].copy_from_slice(&self.buf);
    }
}

fn set_ip(ctx: &mut CpuContext, ip: u64) {
    match ctx {
        CpuContext::B32(regs) => regs.eip = ip as u32,
        CpuContext::B64(regs) => regs.rip = ip,
    }
}
