//! A library for driving `dlopen`, `dlsym` and `dlclose` inside a running
//! process via ptrace.
//!
//! The target process (the *tracee*) does not cooperate: we attach to it,
//! allocate a small scratch region in its address space, synthesize a few
//! bytes of machine code that call the tracee's own dynamic-linker entry
//! points, run that code under trace control and read the return value back
//! out of `rax`. On success the tracee's registers and memory are restored
//! bit for bit, so from its point of view nothing happened — except that a
//! library is now loaded.
//!
//! # Platform support
//!
//! This library only supports x86-64 Linux. The machine code it synthesizes
//! and the SysV calling convention it relies on are specific to that
//! architecture; supporting another one would mean a per-arch code builder.
//!
//! # Example
//!
//! ```no_run
//! use ptrace_dlfcn::{Injector, Process, RTLD_NOW};
//!
//! # fn main() -> eyre::Result<()> {
//! let proc = Process::by_name("target-process")?.expect("to find target process");
//! let mut injector = Injector::attach(proc)?;
//!
//! let handle = injector.dlopen("path/to/library.so".as_ref(), RTLD_NOW)?;
//! let function = injector.dlsym(handle, "my_function")?;
//! let result = injector.call(function, &[])?;
//! println!("my_function returned {result:#x}");
//!
//! injector.dlclose(handle)?;
//! injector.resume()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Ptrace note
//!
//! On many Linux distributions the kernel is configured to prevent a process
//! from calling ptrace() on another process it did not create. You can
//! temporarily disable that until the next reboot with:
//!
//! ```text
//! echo 0 | sudo tee /proc/sys/kernel/yama/ptrace_scope
//! ```
//!
//! Tracing your own child processes is allowed under the default setting.
//!
//! # Fatal errors
//!
//! Recoverable failures — an unknown module, a missing symbol, a failed
//! allocation — are reported through [`eyre::Result`]. Failures that leave
//! the tracee in an unknowable state (a register restore or scratch free
//! going wrong after code already ran, or an unexpected wait result) abort
//! the controller with a panic instead: there is no way to reason about
//! recovery once the tracee is damaged, so we choose loud failure over
//! silent corruption.
//!
//! This library uses [`log`](https://crates.io/crates/log) for logging.
#![warn(clippy::all, clippy::pedantic, clippy::nursery, missing_docs)]
#![allow(
    // Errors can happen for such a diverse set of reasons out of the user's
    // control that listing them all in a form other than error context
    // chains would not be feasible or useful.
    clippy::missing_errors_doc,
    // Register names like `rsi` and `rdi` break this.
    clippy::similar_names,
    // The fatal paths are documented at the crate level.
    clippy::missing_panics_doc,
)]
use eyre::{eyre, Context, Result};

pub use machine_code::MachineCode;
pub use process::{Module, Process};
pub use symbols::find_function_address;

mod execute;
mod injection;
mod machine_code;
mod process;
mod scratch;
mod symbols;

/// Resolve all symbols immediately when loading (`RTLD_NOW`).
pub const RTLD_NOW: u32 = libc::RTLD_NOW as u32;

/// Resolve symbols lazily as they are first referenced (`RTLD_LAZY`).
pub const RTLD_LAZY: u32 = libc::RTLD_LAZY as u32;

/// A type that owns a ptrace'd target process and runs dynamic-linker
/// operations inside it.
///
/// The tracee stays stopped between operations. Call [`Injector::resume`] to
/// set it running again; when the controller process exits the kernel
/// detaches whatever is still attached.
pub struct Injector {
    /// The process we are injecting into.
    proc: Process,
    /// The tracer that is controlling the tracee.
    tracer: pete::Ptracer,
    /// The main thread of the target, in its most recent trace stop.
    tracee: pete::Tracee,
}

impl Injector {
    /// Attach to a running process and stop it, along with its threads.
    pub fn attach(proc: Process) -> Result<Self> {
        let mut tracer = pete::Ptracer::new();
        tracer
            .attach((&proc).into())
            .wrap_err("failed to attach to given process")?;
        let Some(tracee) = tracer
            .wait()
            .wrap_err("failed to wait for attached process to stop")?
        else {
            return Err(eyre!(
                "the target exited quietly as soon as we started tracing it"
            ));
        };
        log::info!("Attached to process with PID {}", proc);
        let mut injector = Self {
            proc,
            tracer,
            tracee,
        };
        injector
            .attach_threads()
            .wrap_err("failed to attach to child threads")?;
        Ok(injector)
    }

    /// Attach to all child threads of the process.
    fn attach_threads(&mut self) -> Result<()> {
        let threads = self
            .proc
            .thread_ids()
            .wrap_err("couldn't get thread IDs of target to attach to them")?;
        log::trace!("Attaching to {} child threads of target", threads.len() - 1);
        threads
            .iter()
            .filter(|&tid| tid != &self.proc.pid())
            .try_for_each(|&tid| {
                self.tracer
                    .attach(pete::Pid::from_raw(tid))
                    .wrap_err_with(|| format!("failed to attach to child thread with TID {tid}"))?;
                // The order that the threads stop is not necessarily the same
                // as the order that they were attached to, so we don't know
                // what tracee we're getting here. They all stay stopped either
                // way.
                let actual_tid = self
                    .tracer
                    .wait()
                    .wrap_err("failed to wait for thread to stop")?
                    .ok_or_else(|| {
                        eyre!("a target thread exited quietly as soon as we started tracing it")
                    })?
                    .pid;
                log::trace!("Attached to thread ID {actual_tid} of target process");
                Ok(())
            })
    }

    /// The PID of the target process.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.proc.pid()
    }

    /// Read the tracee's current general-purpose registers.
    ///
    /// Mostly useful for diagnostics; every operation on this type restores
    /// the registers it found before returning.
    pub fn registers(&self) -> Result<pete::Registers> {
        self.tracee
            .registers()
            .wrap_err("failed to read tracee registers")
    }

    /// Resolve the absolute runtime address of `function_name` within the
    /// module of the target whose name starts with `module_prefix`.
    pub fn find_function_address(&self, function_name: &str, module_prefix: &str) -> Result<u64> {
        symbols::find_function_address(&self.proc, function_name, module_prefix)
    }

    /// Set the tracee running again, consuming the injector.
    ///
    /// The process stays attached until the controller exits, at which point
    /// the kernel detaches it.
    pub fn resume(mut self) -> Result<()> {
        log::debug!("Resuming tracee with PID {}", self.proc);
        self.tracer
            .restart(self.tracee, pete::Restart::Continue)
            .wrap_err("failed to resume tracee")
    }
}
