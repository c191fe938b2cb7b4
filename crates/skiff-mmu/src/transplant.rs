use crate::dispatch::Dispatcher;
use crate::engine::{ArchState, ExecutionEngine, XREG_COUNT};
use crate::error::{MmuError, Result};
use crate::transport::DeviceTransport;

/// Where a hardware thread slot currently lives.
///
/// `ResumingOnHost` / `ResumingOnDevice` are transient: they exist only
/// while a transplant is being serviced, and settle to `Idle` (state stays
/// on the software engine) or `Running` (state pushed back to the device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On the software engine, not offloaded.
    Idle,
    /// Executing on the device.
    Running,
    /// The device raised an exception, hit an undefined instruction, or
    /// exhausted its instruction budget; state is waiting to be pulled.
    TransplantPending,
    /// Pulled back; the software engine keeps it.
    ResumingOnHost,
    /// Pulled back, stepped, and about to be pushed to the device again.
    ResumingOnDevice,
}

impl Dispatcher {
    /// Push every configured thread to the device and start it.
    pub fn launch_all<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
    ) {
        for thread in 0..self.slots.len() as u32 {
            let mut state = engine.arch_state(thread);
            state.icount_budget = self.config().instruction_budget;
            state.icount_executed = 0;
            transport.push_state(thread, &state);
            transport.start(thread);
            self.slots[thread as usize] = ThreadState::Running;
            log::debug!("thread {thread} launched (asid {:#x})", state.asid);
        }
    }

    /// Service every thread the device has flagged for transplant.
    pub fn poll_transplants<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
    ) -> Result<()> {
        let mask = transport.pending_mask();
        if mask == 0 {
            return Ok(());
        }
        for thread in 0..self.slots.len() as u32 {
            if mask & (1 << thread) != 0 && self.slots[thread as usize] == ThreadState::Running {
                self.transplant_one(engine, transport, thread)?;
            }
        }
        Ok(())
    }

    /// Pull one thread back, run it through the software engine, and decide
    /// where it resumes.
    pub(crate) fn transplant_one<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        thread: u32,
    ) -> Result<()> {
        let slot = &mut self.slots[thread as usize];
        debug_assert_eq!(*slot, ThreadState::Running);
        *slot = ThreadState::TransplantPending;

        let device_state = transport.pull_state(thread);
        log::debug!(
            "thread {thread} transplanted back (pc {:#x}, executed {})",
            device_state.pc,
            device_state.icount_executed
        );

        if self.config().debug.compares() {
            let host_state = engine.arch_state(thread);
            if compare_arch_states(thread, &host_state, &device_state) {
                return Err(MmuError::ArchMismatch {
                    thread,
                    pc: device_state.pc,
                });
            }
        }

        engine.set_arch_state(thread, &device_state);

        if self.is_running() && !self.config().pure_singlestep {
            // Let the software engine take the thread through whatever the
            // device could not execute (exception entry, undefined
            // instruction), then hand it back.
            self.slots[thread as usize] = ThreadState::ResumingOnHost;
            self.single_step_checked(engine, thread)?;

            if self.is_running() {
                self.slots[thread as usize] = ThreadState::ResumingOnDevice;
                let mut state = engine.arch_state(thread);
                state.asid = engine.current_asid(thread);
                state.icount_budget = self.config().instruction_budget;
                state.icount_executed = 0;
                transport.push_state(thread, &state);
                transport.start(thread);
                self.slots[thread as usize] = ThreadState::Running;
                return Ok(());
            }
        }

        self.slots[thread as usize] = ThreadState::Idle;
        Ok(())
    }

    /// Single-step with the stuck-PC escalation: a step that does not move
    /// the PC is retried once, then treated as fatal.
    fn single_step_checked<E: ExecutionEngine>(&self, engine: &mut E, thread: u32) -> Result<()> {
        let before = engine.arch_state(thread).pc;
        engine.single_step(thread);
        if engine.arch_state(thread).pc != before {
            return Ok(());
        }
        engine.single_step(thread);
        if engine.arch_state(thread).pc != before {
            return Ok(());
        }
        Err(MmuError::StuckSingleStep { thread, pc: before })
    }

    /// Force every offloaded thread back to the software engine.
    ///
    /// Used on stop: after this every slot is `Idle` and the engine holds
    /// the authoritative state for all of them.
    pub fn drain_all<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
    ) {
        for thread in 0..self.slots.len() as u32 {
            if self.slots[thread as usize] == ThreadState::Idle {
                continue;
            }
            transport.stop(thread);
            let state = transport.pull_state(thread);
            engine.set_arch_state(thread, &state);
            self.slots[thread as usize] = ThreadState::Idle;
            log::debug!("thread {thread} drained to host (pc {:#x})", state.pc);
        }
    }

    #[inline]
    pub fn thread_state(&self, thread: u32) -> ThreadState {
        self.slots[thread as usize]
    }
}

/// Bit-exact comparison of the two substrates' register files.
///
/// Logs every mismatching register before reporting, so the fatal path shows
/// the whole divergence and not just the first register.
fn compare_arch_states(thread: u32, host: &ArchState, device: &ArchState) -> bool {
    let mut mismatch = false;
    if host.pc != device.pc {
        log::error!(
            "thread {thread}: pc mismatch (emulator {:#x}, device {:#x})",
            host.pc,
            device.pc
        );
        mismatch = true;
    }
    for reg in 0..XREG_COUNT {
        if host.xregs[reg] != device.xregs[reg] {
            log::error!(
                "thread {thread}: x{reg} mismatch (emulator {:#x}, device {:#x})",
                host.xregs[reg],
                device.xregs[reg]
            );
            mismatch = true;
        }
    }
    if host.flags != device.flags {
        log::error!(
            "thread {thread}: flags mismatch (emulator {:#x}, device {:#x})",
            host.flags,
            device.flags
        );
        mismatch = true;
    }
    if host.asid != device.asid {
        log::error!(
            "thread {thread}: asid mismatch (emulator {:#x}, device {:#x})",
            host.asid,
            device.asid
        );
        mismatch = true;
    }
    mismatch
}
