//! Guest execution control: attach/detach, breakpoints and stepping.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::breakpoint::{Breakpoint, BreakpointManager, TRAP_WORD};
use crate::domain::{Domain, MapProt, VcpuId};
use crate::error::{DomainError, Error};
use crate::predict::Predictor;
use crate::regs::CpuContext;

/// Poll cadence while waiting for the guest to halt on a trap.
///
/// Bounds stop latency while keeping the overhead negligible.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run state of an attached guest.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    /// All VCPUs halted.
    Paused,

    /// Guest released until the next trap hit.
    Running,

    /// Guest released for the duration of one predicted step.
    Stepping,
}

/// State owned for the duration of one attachment.
struct Attachment {
    /// Decoder handle, opened for the guest word size.
    predictor: Predictor,

    /// Patched guest addresses.
    breakpoints: BreakpointManager,

    /// User-defined variables, independent of the guest.
    variables: HashMap<String, u64>,

    /// VCPU targeted by register and stepping operations.
    vcpu: VcpuId,

    /// Current run state.
    state: RunState,
}

/// Execution controller over one guest domain.
///
/// Owns the domain handle and, while attached, the breakpoint table and
/// the decoder. Every operation other than [attach](Self::attach) fails
/// with [Error::NotAttached] until a guest is attached.
pub struct Debugger<D: Domain> {
    domain: D,
    attachment: Option<Attachment>,
}

impl<D: Domain> Debugger<D> {
    /// Creates a detached controller over the given domain.
    pub fn new(domain: D) -> Self {
        Self {
            domain,
            attachment: None,
        }
    }

    /// Shared handle to the underlying domain.
    pub fn domain(&self) -> &D {
        &self.domain
    }

    /// Whether a guest is currently attached.
    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// Run state of the attached guest, if any.
    pub fn run_state(&self) -> Option<RunState> {
        self.attachment.as_ref().map(|att| att.state)
    }

    fn attached(&self) -> Result<&Attachment, Error<D::Error>> {
        self.attachment.as_ref().ok_or(Error::NotAttached)
    }

    /// Attaches to the guest: enables hypervisor-side debugging, pauses
    /// the guest and opens the decoder.
    ///
    /// Attaching twice is a no-op.
    pub fn attach(&mut self) -> Result<(), Error<D::Error>> {
        if self.attachment.is_some() {
            return Ok(());
        }

        self.domain.set_debugging(true).map_err(DomainError)?;
        self.domain.pause().map_err(DomainError)?;

        let predictor = match Predictor::open(self.domain.word_size()) {
            Ok(predictor) => predictor,
            Err(e) => {
                if let Err(e) = self.domain.unpause() {
                    tracing::error!(error = %e, "failed to release guest after attach failure");
                }
                return Err(e);
            }
        };

        self.attachment = Some(Attachment {
            predictor,
            breakpoints: BreakpointManager::new(),
            variables: HashMap::new(),
            vcpu: 0,
            state: RunState::Paused,
        });

        tracing::info!(domid = self.domain.id(), "attached");

        Ok(())
    }

    /// Detaches from the guest: restores every breakpoint, closes the
    /// decoder and releases the guest.
    ///
    /// Failure to restore a breakpoint is logged; detach still completes.
    pub fn detach(&mut self) -> Result<(), Error<D::Error>> {
        let Some(mut att) = self.attachment.take() else {
            return Ok(());
        };

        self.domain.pause().map_err(DomainError)?;

        if let Err(e) = att.breakpoints.drain(&self.domain) {
            tracing::error!(error = %e, "failed to restore breakpoints during detach");
        }

        self.domain.unpause().map_err(DomainError)?;

        tracing::info!(domid = self.domain.id(), "detached");

        Ok(())
    }

    /// VCPU targeted by register and stepping operations.
    pub fn vcpu(&self) -> Result<VcpuId, Error<D::Error>> {
        Ok(self.attached()?.vcpu)
    }

    /// Selects the VCPU targeted by register and stepping operations.
    pub fn set_vcpu(&mut self, vcpu: VcpuId) -> Result<(), Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;
        att.vcpu = vcpu;
        Ok(())
    }

    /// Snapshot of the current VCPU's register file.
    pub fn cpu_context(&self) -> Result<CpuContext, Error<D::Error>> {
        let att = self.attached()?;
        Ok(self.domain.get_cpu_context(att.vcpu).map_err(DomainError)?)
    }

    /// Writes back a register file to the current VCPU.
    pub fn set_cpu_context(&mut self, ctx: &CpuContext) -> Result<(), Error<D::Error>> {
        let att = self.attached()?;
        Ok(self
            .domain
            .set_cpu_context(att.vcpu, ctx)
            .map_err(DomainError)?)
    }

    /// Reads a register of the current VCPU by name.
    pub fn read_register(&self, name: &str) -> Result<u64, Error<D::Error>> {
        self.cpu_context()?
            .read_by_name(name)
            .ok_or_else(|| Error::NoSuchRegister(name.to_owned()))
    }

    /// Creates a breakpoint at the given guest address and returns its ID.
    ///
    /// Creating a second breakpoint at an already-patched address returns
    /// the existing ID.
    pub fn create_breakpoint(&mut self, addr: u64) -> Result<u64, Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;

        let was_running = att.state == RunState::Running;
        if was_running {
            self.domain.pause().map_err(DomainError)?;
        }

        let res = att.breakpoints.insert(&self.domain, addr);

        if was_running {
            self.domain.unpause().map_err(DomainError)?;
        }

        res
    }

    /// Restores and removes the breakpoint with the given ID.
    pub fn delete_breakpoint(&mut self, id: u64) -> Result<(), Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;

        let was_running = att.state == RunState::Running;
        if was_running {
            self.domain.pause().map_err(DomainError)?;
        }

        let res = att.breakpoints.remove_by_id(&self.domain, id);

        if was_running {
            self.domain.unpause().map_err(DomainError)?;
        }

        res
    }

    /// Breakpoints currently planted, in unspecified order.
    pub fn breakpoints(&self) -> Result<Vec<Breakpoint>, Error<D::Error>> {
        Ok(self.attached()?.breakpoints.iter().copied().collect())
    }

    /// Looks up a breakpoint by its guest address.
    pub fn find_breakpoint(&self, addr: u64) -> Result<Option<Breakpoint>, Error<D::Error>> {
        Ok(self.attached()?.breakpoints.find_by_address(addr))
    }

    /// Reads guest memory with breakpoint patches masked out.
    ///
    /// Consistent only while the guest is paused.
    pub fn read_memory_masking(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error<D::Error>> {
        let att = self.attached()?;
        att.breakpoints.read_masking(&self.domain, addr, len)
    }

    /// Writes guest memory, keeping planted breakpoints intact.
    pub fn write_memory_retaining(&mut self, addr: u64, data: &[u8]) -> Result<(), Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;

        let was_running = att.state == RunState::Running;
        if was_running {
            self.domain.pause().map_err(DomainError)?;
        }

        let res = att.breakpoints.write_retaining(&self.domain, addr, data);

        if was_running {
            self.domain.unpause().map_err(DomainError)?;
        }

        res
    }

    /// Whether the current VCPU sits on a planted trap.
    ///
    /// A hit requires both the trap word under the program counter and a
    /// table entry for that address, so a guest's own `EB FE` is never
    /// misreported.
    pub fn check_breakpoint_hit(&self) -> Result<Option<u64>, Error<D::Error>> {
        let att = self.attached()?;
        hit_at(&self.domain, &att.breakpoints, att.vcpu)
    }

    /// Releases the guest until the next trap hit.
    ///
    /// If the program counter sits on a breakpoint, one single step is
    /// performed first; the step lifts and replants the trap so the guest
    /// can make progress through it.
    pub async fn resume_guest(&mut self, cancel: &CancellationToken) -> Result<(), Error<D::Error>> {
        self.attached()?;

        if self.check_breakpoint_hit()?.is_some() {
            self.single_step(cancel).await?;
        }

        self.domain.unpause().map_err(DomainError)?;

        if let Some(att) = self.attachment.as_mut() {
            att.state = RunState::Running;
        }

        tracing::debug!("guest resumed");

        Ok(())
    }

    /// Polls until the guest halts on a planted trap, then pauses it and
    /// returns the hit address.
    ///
    /// Cancelling pauses the guest and returns [Error::Cancelled].
    pub async fn wait_for_stop(&mut self, cancel: &CancellationToken) -> Result<u64, Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;

        let hit = loop {
            if cancel.is_cancelled() {
                self.domain.pause().map_err(DomainError)?;
                att.state = RunState::Paused;
                return Err(Error::Cancelled);
            }

            if let Some(addr) = hit_at(&self.domain, &att.breakpoints, att.vcpu)? {
                break addr;
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        self.domain.pause().map_err(DomainError)?;
        att.state = RunState::Paused;

        tracing::debug!(addr = format_args!("{hit:#x}"), "breakpoint hit");

        Ok(hit)
    }

    /// Executes exactly one guest instruction and returns the address the
    /// guest stopped at.
    ///
    /// The trap under the program counter (if any) is lifted for the
    /// duration of the step; transient traps are planted at the predicted
    /// successors, the guest runs until it halts on one of them, and the
    /// transient traps are removed again.
    ///
    /// On failure or cancellation the guest is left paused, planted
    /// transient traps are removed and the lifted trap is replanted,
    /// best-effort, before the error is surfaced.
    pub async fn single_step(&mut self, cancel: &CancellationToken) -> Result<u64, Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;

        self.domain.pause().map_err(DomainError)?;
        att.state = RunState::Stepping;

        let res = step_guest(&self.domain, att, cancel).await;

        att.state = RunState::Paused;

        res
    }

    /// Sets (or overwrites) a user variable.
    pub fn set_var(&mut self, name: impl Into<String>, value: u64) -> Result<(), Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;
        att.variables.insert(name.into(), value);
        Ok(())
    }

    /// Reads a user variable.
    pub fn get_var(&self, name: &str) -> Result<u64, Error<D::Error>> {
        self.attached()?
            .variables
            .get(name)
            .copied()
            .ok_or_else(|| Error::NoSuchVariable(name.to_owned()))
    }

    /// Deletes a user variable.
    pub fn delete_var(&mut self, name: &str) -> Result<(), Error<D::Error>> {
        let att = self.attachment.as_mut().ok_or(Error::NotAttached)?;

        att.variables
            .remove(name)
            .map(drop)
            .ok_or_else(|| Error::NoSuchVariable(name.to_owned()))
    }
}

/// One full predicted step of the guest, with the guest initially paused.
async fn step_guest<D: Domain>(
    domain: &D,
    att: &mut Attachment,
    cancel: &CancellationToken,
) -> Result<u64, Error<D::Error>> {
    let ctx = domain.get_cpu_context(att.vcpu).map_err(DomainError)?;
    let ip = ctx.instr_ptr();

    // Lift the trap under the program counter so the original instruction
    // can execute.
    let stepped_over = att.breakpoints.remove_at(domain, ip)?;

    let (primary, alternate) = match att.predictor.successors(domain, &ctx) {
        Ok(successors) => successors,
        Err(e) => {
            replant_lifted(domain, att, stepped_over);
            return Err(e);
        }
    };

    tracing::debug!(
        from = format_args!("{ip:#x}"),
        primary = format_args!("{primary:#x}"),
        alternate = ?alternate,
        "stepping"
    );

    let mut transients: Vec<u64> = Vec::with_capacity(2);

    for dest in [Some(primary), alternate].into_iter().flatten() {
        if att.breakpoints.is_patched(dest) {
            // an existing user breakpoint doubles as the step trap
            continue;
        }

        if let Err(e) = att.breakpoints.insert(domain, dest) {
            remove_transients(domain, att, &transients);
            replant_lifted(domain, att, stepped_over);
            return Err(e);
        }

        transients.push(dest);
    }

    if let Err(e) = domain.unpause() {
        remove_transients(domain, att, &transients);
        replant_lifted(domain, att, stepped_over);
        return Err(DomainError(e).into());
    }

    let hit = loop {
        match hit_at(domain, &att.breakpoints, att.vcpu) {
            Ok(Some(addr)) => break addr,
            Ok(None) => {}
            Err(e) => {
                if let Err(e) = domain.pause() {
                    tracing::error!(error = %e, "failed to halt guest while unwinding a step");
                }
                remove_transients(domain, att, &transients);
                replant_lifted(domain, att, stepped_over);
                return Err(e);
            }
        }

        if cancel.is_cancelled() {
            if let Err(e) = domain.pause() {
                tracing::error!(error = %e, "failed to halt guest on step cancellation");
            }
            remove_transients(domain, att, &transients);
            replant_lifted(domain, att, stepped_over);
            return Err(Error::Cancelled);
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    };

    if let Err(e) = domain.pause() {
        remove_transients(domain, att, &transients);
        replant_lifted(domain, att, stepped_over);
        return Err(DomainError(e).into());
    }

    remove_transients(domain, att, &transients);
    replant_lifted(domain, att, stepped_over);

    tracing::debug!(
        from = format_args!("{ip:#x}"),
        to = format_args!("{hit:#x}"),
        "single step complete"
    );

    Ok(hit)
}

/// Trap-hit test: the program counter points at the trap word AND that
/// address is in the breakpoint table.
fn hit_at<D: Domain>(
    domain: &D,
    breakpoints: &BreakpointManager,
    vcpu: VcpuId,
) -> Result<Option<u64>, Error<D::Error>> {
    let ctx = domain.get_cpu_context(vcpu).map_err(DomainError)?;
    let ip = ctx.instr_ptr();

    let window = domain
        .map_memory(ip, 2, MapProt::Read)
        .map_err(DomainError)?;
    let word = u16::from_le_bytes([window[0], window[1]]);

    Ok((word == TRAP_WORD && breakpoints.is_patched(ip)).then_some(ip))
}

/// Removes transient step traps, logging (not surfacing) failures.
fn remove_transients<D: Domain>(domain: &D, att: &mut Attachment, transients: &[u64]) {
    for &addr in transients {
        if let Err(e) = att.breakpoints.remove_at(domain, addr) {
            tracing::error!(
                error = %e,
                addr = format_args!("{addr:#x}"),
                "failed to remove transient trap"
            );
        }
    }
}

/// Replants the breakpoint lifted at the start of a step, if any.
fn replant_lifted<D: Domain>(domain: &D, att: &mut Attachment, lifted: Option<Breakpoint>) {
    let Some(bp) = lifted else { return };

    if let Err(e) = att.breakpoints.replant(domain, bp) {
        tracing::error!(
            error = %e,
            addr = format_args!("{:#x}", bp.addr),
            "failed to replant breakpoint after step"
        );
    }
}
