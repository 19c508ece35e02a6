//! Scratch memory inside the tracee.
//!
//! The code blobs and their inline string arguments need somewhere to live
//! in the target's address space. We get it from the target's own kernel by
//! running `mmap` inside the tracee: a three-byte `syscall; int3` stub is
//! written over the start of an existing executable mapping, executed with
//! the syscall number and arguments placed in registers, and the borrowed
//! bytes are put back before anything else happens. `munmap` releases the
//! region the same way.

use crate::Injector;
use eyre::{eyre, Context, Result};

/// `syscall; int3`.
const SYSCALL_STUB: [u8; 3] = [0x0f, 0x05, 0xcc];

/// Kernel error returns occupy the last page of the address space.
const ERRNO_START: u64 = -4096_i64 as u64;

impl Injector {
    /// Map `size` bytes of fresh readable, writable and executable memory in
    /// the tracee, returning its base address.
    pub(crate) fn allocate_scratch(&mut self, size: u64) -> Result<u64> {
        let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let address = self
            .remote_syscall(
                libc::SYS_mmap,
                [
                    0,
                    size,
                    prot as u64,
                    flags as u64,
                    u64::MAX, // fd of -1 for an anonymous mapping
                    0,
                ],
            )
            .wrap_err("failed to allocate scratch memory in tracee")?;
        log::debug!("Allocated {size} bytes of scratch at {address:#x} in tracee");
        Ok(address)
    }

    /// Release a scratch allocation by its exact base address and size.
    pub(crate) fn free_scratch(&mut self, address: u64, size: u64) -> Result<()> {
        self.remote_syscall(libc::SYS_munmap, [address, size, 0, 0, 0, 0])
            .map(drop)
            .wrap_err("failed to free scratch memory in tracee")?;
        log::debug!("Freed {size} bytes of scratch at {address:#x} in tracee");
        Ok(())
    }

    /// Release a scratch allocation, treating failure as unrecoverable.
    ///
    /// Used on the cleanup paths, where a leftover executable mapping in the
    /// tracee must not be ignored silently.
    pub(crate) fn free_scratch_or_die(&mut self, address: u64, size: u64) {
        if let Err(error) = self.free_scratch(address, size) {
            panic!("unable to free previously allocated memory in tracee: {error:#}");
        }
    }

    /// Run a syscall inside the tracee and return its result.
    ///
    /// Register and memory state around the call is captured and restored, so
    /// the call is invisible to the tracee. Errors from the syscall itself
    /// are recoverable; a failure to restore the borrowed state is not.
    fn remote_syscall(&mut self, number: libc::c_long, args: [u64; 6]) -> Result<u64> {
        let original_registers = self
            .tracee
            .registers()
            .wrap_err("failed to back up tracee registers")?;
        let stub_address = self
            .proc
            .find_executable_space()
            .wrap_err("couldn't find an executable mapping to hold the syscall stub")?;
        let saved_code = self
            .tracee
            .read_memory(stub_address, SYSCALL_STUB.len())
            .wrap_err("failed to read the code bytes we were going to overwrite")?;
        self.tracee
            .write_memory(stub_address, &SYSCALL_STUB)
            .wrap_err("failed to write syscall stub to tracee")?;
        log::trace!(
            "Invoking syscall {number} in tracee via stub at {stub_address:#x}"
        );

        #[allow(clippy::cast_sign_loss)]
        let registers = pete::Registers {
            rax: number as u64,
            rdi: args[0],
            rsi: args[1],
            rdx: args[2],
            r10: args[3],
            r8: args[4],
            r9: args[5],
            ..Self::registers_for_code(original_registers, stub_address)
        };
        self.execute_or_die(registers);
        let result = self.return_value_or_die();

        self.restore_registers_or_die(original_registers);
        if let Err(error) = self.tracee.write_memory(stub_address, &saved_code) {
            panic!("unable to restore code overwritten by the syscall stub: {error}");
        }
        log::trace!("Restored code bytes borrowed for the syscall stub");

        if result >= ERRNO_START {
            #[allow(clippy::cast_possible_wrap)]
            return Err(eyre!(
                "syscall {number} in tracee failed with errno {}",
                -(result as i64)
            ));
        }
        Ok(result)
    }
}
