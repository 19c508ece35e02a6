use eyre::{eyre, Context, Result};
use procfs::process;
use std::fmt::Display;
use std::path::PathBuf;

/// A process to attach to.
#[derive(Debug)]
pub struct Process(process::Process);

/// A module (the main executable, a shared library, the vDSO, ...) loaded
/// into a process, as read from its memory map.
#[derive(Debug, Clone)]
pub struct Module {
    /// The display name of the module, i.e. the file name of its backing
    /// object, like `libc.so.6`.
    pub name: String,
    /// The path to the object file backing the module on disk.
    pub file_path: PathBuf,
    /// The virtual address the module is loaded at in the process.
    pub address_start: u64,
}

impl Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.pid)
    }
}

impl Process {
    /// Get the current running process.
    pub fn current() -> Result<Self> {
        Ok(Self(
            process::Process::myself().wrap_err("failed to get PID of current process")?,
        ))
    }

    /// Get a process by its PID.
    pub fn get(id: u32) -> Result<Self> {
        // https://unix.stackexchange.com/a/16884 - A PID should fit in 31 bits comfortably.
        let id = i32::try_from(id).expect("PID to fit in an i32");
        log::trace!("Getting process with PID {}", id);
        Ok(Self(
            process::Process::new(id).wrap_err(format!("failed to get process by pid {id}"))?,
        ))
    }

    /// Search for a process by the name of its executable.
    ///
    /// This ignores errors when the executable name of certain processes
    /// cannot be read (usually because of lack of permissions).
    pub fn by_name(name: &str) -> Result<Option<Self>> {
        log::debug!("Searching for process with executable name {}", name);
        for process in
            process::all_processes().wrap_err("failed to list processes to search them")?
        {
            let process = process.wrap_err("failed to read process metadata to check its name")?;
            log::trace!("Checking process {}", process.pid);
            if let Ok(exe) = process.exe() {
                if exe.ends_with(name) {
                    log::info!("Found process with PID {}", process.pid);
                    return Ok(Some(Self(process)));
                }
            } else {
                // This is common, if we don't have permissions to read certain
                // processes information.
                log::trace!("Could not read executable name of process {}", process.pid);
            }
        }
        Ok(None)
    }

    /// The PID of the process.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.0.pid
    }

    /// The thread IDs of all threads of the process, including the main one.
    pub(crate) fn thread_ids(&self) -> Result<Vec<i32>> {
        Ok(self
            .0
            .tasks()
            .wrap_err("failed to list tasks of process")?
            .flatten()
            .map(|task| task.tid)
            .collect())
    }

    /// List the modules loaded into the process, in memory-map order.
    ///
    /// Each file-backed mapping contributes one module, at the address of its
    /// lowest mapping (`/proc/<pid>/maps` is sorted, so the first mapping of
    /// an object is its load base).
    pub fn modules(&self) -> Result<Vec<Module>> {
        let mut modules: Vec<Module> = Vec::new();
        for map in self
            .0
            .maps()
            .wrap_err("failed to read process memory maps to list modules")?
        {
            let process::MMapPath::Path(path) = map.pathname else {
                continue;
            };
            if modules.iter().any(|module| module.file_path == path) {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            modules.push(Module {
                name: name.to_string_lossy().into_owned(),
                file_path: path.clone(),
                address_start: map.address.0,
            });
        }
        log::trace!("Found {} modules in process {}", modules.len(), self.0.pid);
        Ok(modules)
    }

    /// Find the address of an existing executable mapping in the process.
    ///
    /// A few bytes at this address can be borrowed for a stub, as long as the
    /// original contents are put back before the tracee runs freely again.
    pub(crate) fn find_executable_space(&self) -> Result<u64> {
        log::trace!("Finding executable space in target process");
        self.0
            .maps()
            .wrap_err("failed to read process memory maps to find executable region")?
            .into_iter()
            .find(|m| m.perms.contains(process::MMPermissions::EXECUTE))
            .map(|m| m.address.0)
            .ok_or(eyre!(
                "could not find an executable region in the target process"
            ))
    }
}

impl From<&Process> for pete::Pid {
    fn from(proc: &Process) -> Self {
        Self::from_raw(proc.0.pid)
    }
}
