//! The dynamic-library operations themselves.
//!
//! Every operation follows the same shape: resolve the linker entry point in
//! the tracee, capture its registers, allocate scratch memory, write the
//! argument payload and a small code blob, run the blob to the breakpoint at
//! its end, read `rax`, then restore the registers and free the scratch. If
//! anything fails recoverably between the allocation and the execution, the
//! scratch is freed before the error is returned; the registers have not
//! been touched yet at that point.

use crate::machine_code::MachineCode;
use crate::symbols;
use crate::Injector;
use eyre::{eyre, Context, Result};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Size of the area at the base of every scratch allocation that is reserved
/// for machine code. Inline string arguments are placed after it.
const CODE_SCRATCH_PAD_SIZE: u64 = 1024;

/// Where the `dl*` entry points may live, by C library generation: `libdl`
/// before glibc 2.34, `libc` itself afterwards, and the underscored internal
/// names for old processes that never loaded `libdl`.
const DLOPEN_CANDIDATES: &[(&str, &str)] = &[
    ("dlopen", "libdl"),
    ("dlopen", "libc"),
    ("__libc_dlopen_mode", "libc"),
];
const DLSYM_CANDIDATES: &[(&str, &str)] = &[
    ("dlsym", "libdl"),
    ("dlsym", "libc"),
    ("__libc_dlsym", "libc"),
];
const DLCLOSE_CANDIDATES: &[(&str, &str)] = &[
    ("dlclose", "libdl"),
    ("dlclose", "libc"),
    ("__libc_dlclose", "libc"),
];

/// `movabs` opcodes for the first six SysV integer argument registers:
/// `rdi`, `rsi`, `rdx`, `rcx`, `r8`, `r9`.
const ARGUMENT_MOVABS: [[u8; 2]; 6] = [
    [0x48, 0xbf],
    [0x48, 0xbe],
    [0x48, 0xba],
    [0x48, 0xb9],
    [0x49, 0xb8],
    [0x49, 0xb9],
];

impl Injector {
    /// Load the library at `path` into the tracee by calling `dlopen(path,
    /// flag)` there.
    ///
    /// Returns the loader's handle for the library. A handle of zero is the
    /// loader's own way of reporting failure (a missing or unloadable file,
    /// for instance) and is passed through as-is rather than treated as an
    /// error here.
    pub fn dlopen(&mut self, path: &Path, flag: u32) -> Result<u64> {
        let address_dlopen =
            symbols::find_function_address_with_fallback(&self.proc, DLOPEN_CANDIDATES)
                .wrap_err("couldn't resolve dlopen in the tracee")?;

        // The tracee's working directory can be anything, so hand the loader
        // an absolute path where one exists. A path that cannot be resolved
        // is passed through for the loader to report in its own way.
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut payload = path.as_os_str().as_bytes().to_vec();
        payload.push(0);

        let original_registers = self
            .tracee
            .registers()
            .wrap_err("failed to back up tracee registers")?;
        let memory_size = CODE_SCRATCH_PAD_SIZE + payload.len() as u64;
        let address_code = self.allocate_scratch(memory_size)?;
        let address_path = address_code + CODE_SCRATCH_PAD_SIZE;

        let code = dlopen_code(address_path, flag, address_dlopen);
        if let Err(error) = self.write_payload_and_code(address_code, &payload, &code) {
            self.free_scratch_or_die(address_code, memory_size);
            return Err(error);
        }

        self.execute_or_die(Self::registers_for_code(original_registers, address_code));
        let handle = self.return_value_or_die();
        log::debug!("dlopen in tracee returned handle {handle:#x}");

        self.restore_registers_or_die(original_registers);
        self.free_scratch_or_die(address_code, memory_size);
        Ok(handle)
    }

    /// Look up `symbol` in the library behind `handle` by calling
    /// `dlsym(handle, symbol)` in the tracee.
    ///
    /// Returns the symbol's address, or zero if the loader does not know it.
    /// As with [`Injector::dlopen`], zero is not promoted to an error.
    pub fn dlsym(&mut self, handle: u64, symbol: &str) -> Result<u64> {
        let address_dlsym =
            symbols::find_function_address_with_fallback(&self.proc, DLSYM_CANDIDATES)
                .wrap_err("couldn't resolve dlsym in the tracee")?;

        let mut payload = symbol.as_bytes().to_vec();
        payload.push(0);

        let original_registers = self
            .tracee
            .registers()
            .wrap_err("failed to back up tracee registers")?;
        let memory_size = CODE_SCRATCH_PAD_SIZE + payload.len() as u64;
        let address_code = self.allocate_scratch(memory_size)?;
        let address_symbol_name = address_code + CODE_SCRATCH_PAD_SIZE;

        let code = dlsym_code(handle, address_symbol_name, address_dlsym);
        if let Err(error) = self.write_payload_and_code(address_code, &payload, &code) {
            self.free_scratch_or_die(address_code, memory_size);
            return Err(error);
        }

        self.execute_or_die(Self::registers_for_code(original_registers, address_code));
        let address = self.return_value_or_die();
        log::debug!("dlsym({symbol}) in tracee returned {address:#x}");

        self.restore_registers_or_die(original_registers);
        self.free_scratch_or_die(address_code, memory_size);
        Ok(address)
    }

    /// Unload the library behind `handle` by calling `dlclose(handle)` in
    /// the tracee.
    ///
    /// A non-zero return from `dlclose` means the tracee's loader state can
    /// no longer be trusted, so it is treated as fatal rather than returned.
    pub fn dlclose(&mut self, handle: u64) -> Result<()> {
        let address_dlclose =
            symbols::find_function_address_with_fallback(&self.proc, DLCLOSE_CANDIDATES)
                .wrap_err("couldn't resolve dlclose in the tracee")?;

        let original_registers = self
            .tracee
            .registers()
            .wrap_err("failed to back up tracee registers")?;
        let address_code = self.allocate_scratch(CODE_SCRATCH_PAD_SIZE)?;

        let code = dlclose_code(handle, address_dlclose);
        if let Err(error) = self
            .tracee
            .write_memory(address_code, code.bytes())
            .wrap_err("failed to write code blob to tracee")
        {
            self.free_scratch_or_die(address_code, CODE_SCRATCH_PAD_SIZE);
            return Err(error);
        }

        self.execute_or_die(Self::registers_for_code(original_registers, address_code));
        let result = self.return_value_or_die();
        if result != 0 {
            panic!("unable to unload dynamic library from tracee: dlclose returned {result:#x}");
        }
        log::debug!("dlclose in tracee succeeded");

        self.restore_registers_or_die(original_registers);
        self.free_scratch_or_die(address_code, CODE_SCRATCH_PAD_SIZE);
        Ok(())
    }

    /// Call the function at `function_address` in the tracee with up to six
    /// integer arguments, returning the value it leaves in `rax`.
    ///
    /// Together with [`Injector::dlsym`] this is enough to exercise anything
    /// a freshly loaded library exports.
    pub fn call(&mut self, function_address: u64, args: &[u64]) -> Result<u64> {
        if args.len() > ARGUMENT_MOVABS.len() {
            return Err(eyre!(
                "remote calls support at most {} integer arguments, got {}",
                ARGUMENT_MOVABS.len(),
                args.len()
            ));
        }

        let original_registers = self
            .tracee
            .registers()
            .wrap_err("failed to back up tracee registers")?;
        let address_code = self.allocate_scratch(CODE_SCRATCH_PAD_SIZE)?;

        let code = call_code(function_address, args);
        if let Err(error) = self
            .tracee
            .write_memory(address_code, code.bytes())
            .wrap_err("failed to write code blob to tracee")
        {
            self.free_scratch_or_die(address_code, CODE_SCRATCH_PAD_SIZE);
            return Err(error);
        }

        self.execute_or_die(Self::registers_for_code(original_registers, address_code));
        let result = self.return_value_or_die();
        log::debug!("Function at {function_address:#x} in tracee returned {result:#x}");

        self.restore_registers_or_die(original_registers);
        self.free_scratch_or_die(address_code, CODE_SCRATCH_PAD_SIZE);
        Ok(result)
    }

    /// Write the inline argument payload after the code area, then the code
    /// blob at the base of the scratch allocation.
    fn write_payload_and_code(
        &mut self,
        address_code: u64,
        payload: &[u8],
        code: &MachineCode,
    ) -> Result<()> {
        self.tracee
            .write_memory(address_code + CODE_SCRATCH_PAD_SIZE, payload)
            .wrap_err("failed to write argument payload to tracee")?;
        self.tracee
            .write_memory(address_code, code.bytes())
            .wrap_err("failed to write code blob to tracee")?;
        Ok(())
    }
}

/// Code for `dlopen(path, flag)`:
///
/// ```text
/// movabs rdi, address_path     48 bf <address_path>
/// mov esi, flag                be <flag>
/// movabs rax, address_dlopen   48 b8 <address_dlopen>
/// call rax                     ff d0
/// int3                         cc
/// ```
fn dlopen_code(address_path: u64, flag: u32, address_dlopen: u64) -> MachineCode {
    let mut code = MachineCode::new();
    code.append_bytes(&[0x48, 0xbf])
        .append_immediate64(address_path)
        .append_bytes(&[0xbe])
        .append_immediate32(flag)
        .append_bytes(&[0x48, 0xb8])
        .append_immediate64(address_dlopen)
        .append_bytes(&[0xff, 0xd0])
        .append_bytes(&[0xcc]);
    code
}

/// Code for `dlsym(handle, symbol)`:
///
/// ```text
/// movabs rdi, handle                48 bf <handle>
/// movabs rsi, address_symbol_name   48 be <address_symbol_name>
/// movabs rax, address_dlsym         48 b8 <address_dlsym>
/// call rax                          ff d0
/// int3                              cc
/// ```
fn dlsym_code(handle: u64, address_symbol_name: u64, address_dlsym: u64) -> MachineCode {
    let mut code = MachineCode::new();
    code.append_bytes(&[0x48, 0xbf])
        .append_immediate64(handle)
        .append_bytes(&[0x48, 0xbe])
        .append_immediate64(address_symbol_name)
        .append_bytes(&[0x48, 0xb8])
        .append_immediate64(address_dlsym)
        .append_bytes(&[0xff, 0xd0])
        .append_bytes(&[0xcc]);
    code
}

/// Code for `dlclose(handle)`:
///
/// ```text
/// movabs rdi, handle             48 bf <handle>
/// movabs rax, address_dlclose    48 b8 <address_dlclose>
/// call rax                       ff d0
/// int3                           cc
/// ```
fn dlclose_code(handle: u64, address_dlclose: u64) -> MachineCode {
    let mut code = MachineCode::new();
    code.append_bytes(&[0x48, 0xbf])
        .append_immediate64(handle)
        .append_bytes(&[0x48, 0xb8])
        .append_immediate64(address_dlclose)
        .append_bytes(&[0xff, 0xd0])
        .append_bytes(&[0xcc]);
    code
}

/// Code for an arbitrary function call with integer arguments.
fn call_code(function_address: u64, args: &[u64]) -> MachineCode {
    let mut code = MachineCode::new();
    for (movabs, &arg) in ARGUMENT_MOVABS.iter().zip(args) {
        code.append_bytes(movabs).append_immediate64(arg);
    }
    code.append_bytes(&[0x48, 0xb8])
        .append_immediate64(function_address)
        .append_bytes(&[0xff, 0xd0])
        .append_bytes(&[0xcc]);
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlopen_blob_layout() {
        let code = dlopen_code(0x1111_2222_3333_4444, 2, 0x5555_6666_7777_8888);
        let mut expected = vec![0x48, 0xbf];
        expected.extend_from_slice(&0x1111_2222_3333_4444_u64.to_le_bytes());
        expected.push(0xbe);
        expected.extend_from_slice(&2_u32.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xb8]);
        expected.extend_from_slice(&0x5555_6666_7777_8888_u64.to_le_bytes());
        expected.extend_from_slice(&[0xff, 0xd0, 0xcc]);
        assert_eq!(code.bytes(), expected.as_slice());
    }

    #[test]
    fn dlsym_blob_layout() {
        let code = dlsym_code(0xaaaa, 0xbbbb, 0xcccc);
        let mut expected = vec![0x48, 0xbf];
        expected.extend_from_slice(&0xaaaa_u64.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xbe]);
        expected.extend_from_slice(&0xbbbb_u64.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xb8]);
        expected.extend_from_slice(&0xcccc_u64.to_le_bytes());
        expected.extend_from_slice(&[0xff, 0xd0, 0xcc]);
        assert_eq!(code.bytes(), expected.as_slice());
    }

    #[test]
    fn dlclose_blob_layout() {
        let code = dlclose_code(0xdddd, 0xeeee);
        let mut expected = vec![0x48, 0xbf];
        expected.extend_from_slice(&0xdddd_u64.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xb8]);
        expected.extend_from_slice(&0xeeee_u64.to_le_bytes());
        expected.extend_from_slice(&[0xff, 0xd0, 0xcc]);
        assert_eq!(code.bytes(), expected.as_slice());
    }

    #[test]
    fn every_blob_ends_with_a_breakpoint() {
        for code in [
            dlopen_code(1, 2, 3),
            dlsym_code(1, 2, 3),
            dlclose_code(1, 2),
            call_code(1, &[1, 2, 3, 4, 5, 6]),
            call_code(1, &[]),
        ] {
            assert_eq!(code.bytes().last(), Some(&0xcc));
        }
    }

    #[test]
    fn call_blob_loads_each_argument_register() {
        let code = call_code(0xf00d, &[0x11, 0x22, 0x33]);
        let mut expected = vec![0x48, 0xbf];
        expected.extend_from_slice(&0x11_u64.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xbe]);
        expected.extend_from_slice(&0x22_u64.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xba]);
        expected.extend_from_slice(&0x33_u64.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xb8]);
        expected.extend_from_slice(&0xf00d_u64.to_le_bytes());
        expected.extend_from_slice(&[0xff, 0xd0, 0xcc]);
        assert_eq!(code.bytes(), expected.as_slice());
    }
}
