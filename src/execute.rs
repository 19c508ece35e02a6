//! The remote-call executor.
//!
//! Runs a code blob that has already been written into the tracee and ends
//! with an `int3`. Everything here that goes wrong after the tracee's state
//! has been touched is fatal: set-registers, the continue request, or an
//! unexpected wait result all mean the tracee is in an unknowable state, and
//! there is nowhere sensible to propagate such a failure to.

use crate::Injector;

impl Injector {
    /// Compose the register set for running injected code at `address_code`,
    /// starting from a snapshot of the tracee's own registers.
    ///
    /// Everything apart from `rip` is inherited, so the callee sees the
    /// well-formed stack the tracee's own code established.
    pub(crate) fn registers_for_code(
        original_registers: pete::Registers,
        address_code: u64,
    ) -> pete::Registers {
        pete::Registers {
            rip: address_code,
            // If the attach interrupted a syscall the kernel would rewind rip
            // on resume to restart it. A nonsense syscall number disables the
            // restart logic; the snapshot restore puts the real value back.
            orig_rax: u64::MAX,
            ..original_registers
        }
    }

    /// Execute the code at `rip` of `registers` until the tracee traps.
    ///
    /// The code has to end with an `int3`. Panics on anything but a clean
    /// trap stop of the expected thread.
    pub(crate) fn execute_or_die(&mut self, registers: pete::Registers) {
        let pid = self.tracee.pid;
        if let Err(error) = self.tracee.set_registers(registers) {
            panic!("unable to set registers in tracee: {error}");
        }
        log::trace!("Running injected code at {:#x} in tracee", registers.rip);
        if let Err(error) = self.tracer.restart(self.tracee, pete::Restart::Continue) {
            panic!("unable to continue tracee: {error}");
        }
        match self.tracer.wait() {
            Ok(Some(tracee))
                if tracee.pid == pid
                    && matches!(
                        tracee.stop,
                        pete::Stop::SignalDelivery {
                            signal: pete::Signal::SIGTRAP,
                        }
                    ) =>
            {
                log::trace!("Tracee reached the breakpoint");
                self.tracee = tracee;
            }
            other => panic!("failed to wait for breakpoint trap after continuing tracee: {other:?}"),
        }
    }

    /// Read the value the executed code left in `rax`.
    pub(crate) fn return_value_or_die(&self) -> u64 {
        match self.tracee.registers() {
            Ok(registers) => registers.rax,
            Err(error) => panic!("unable to read registers after function call in tracee: {error}"),
        }
    }

    /// Put a previously captured register snapshot back.
    pub(crate) fn restore_registers_or_die(&mut self, original_registers: pete::Registers) {
        if let Err(error) = self.tracee.set_registers(original_registers) {
            panic!("unable to restore register state in tracee: {error}");
        }
        log::trace!("Restored tracee registers");
    }
}
