//! Resolving function addresses in a foreign process.
//!
//! The module map comes from `/proc/<pid>/maps`; the symbols come from the
//! dynamic symbol table of the module's on-disk object file. Composing the
//! two gives an absolute virtual address in the target without touching its
//! memory at all.

use crate::process::{Module, Process};
use eyre::{eyre, Context, Result};
use goblin::elf::program_header::PT_LOAD;
use regex::Regex;

/// Resolve the absolute runtime address of `function_name` within the module
/// of `process` whose name starts with `module_prefix`.
///
/// The prefix may be followed by any combination of `.`, `-` and digits with
/// an optional `so` in the middle, so `libc` selects `libc.so.6` as well as
/// `libc-2.31.so`, but not `libc-helper-1.so`. If several modules match, the
/// last one in memory-map order is used. Only the dynamic symbol table of
/// the module is searched, and the first entry with a matching name wins.
pub fn find_function_address(
    process: &Process,
    function_name: &str,
    module_prefix: &str,
) -> Result<u64> {
    let modules = process
        .modules()
        .wrap_err("failed to list modules of the target process")?;
    let Some(module) = last_matching_module(&modules, module_prefix)? else {
        return Err(eyre!(
            "there is no module \"{module_prefix}\" in process {}",
            process.pid()
        ));
    };
    log::debug!(
        "Module {} is loaded at {:#x} from {}",
        module.name,
        module.address_start,
        module.file_path.display()
    );

    let data = std::fs::read(&module.file_path).wrap_err_with(|| {
        format!(
            "failed to read object file {} backing module \"{module_prefix}\"",
            module.file_path.display()
        )
    })?;
    let elf = goblin::elf::Elf::parse(&data).wrap_err_with(|| {
        format!("failed to parse object file backing module \"{module_prefix}\"")
    })?;
    let load_bias = load_bias(&elf);

    for sym in elf.dynsyms.iter() {
        if elf.dynstrtab.get_at(sym.st_name) == Some(function_name) {
            let address = module.address_start + sym.st_value - load_bias;
            log::debug!("Found {function_name} in {} at {address:#x}", module.name);
            return Ok(address);
        }
    }

    Err(eyre!(
        "unable to locate function symbol \"{function_name}\" in module \"{module_prefix}\""
    ))
}

/// Resolve the first of `candidates` (pairs of function name and module
/// prefix) that can be found in the target.
///
/// Which module exports the `dl*` entry points depends on the C library
/// version: before glibc 2.34 they live in `libdl`, afterwards in `libc`
/// itself, and old processes that never loaded `libdl` expose underscored
/// internal names in `libc` instead. The caller supplies all the names it is
/// willing to use; if none resolves the error carries every diagnostic.
pub(crate) fn find_function_address_with_fallback(
    process: &Process,
    candidates: &[(&str, &str)],
) -> Result<u64> {
    let mut failures = Vec::new();
    for &(function, module) in candidates {
        match find_function_address(process, function, module) {
            Ok(address) => return Ok(address),
            Err(error) => failures.push(format!(
                "failed to load symbol \"{function}\" from module \"{module}\": {error:#}"
            )),
        }
    }
    Err(eyre!(
        "no linker entry point could be resolved: {}",
        failures.join("; and ")
    ))
}

/// Find the module whose display name matches `module_prefix`, taking the
/// last match when there are several.
fn last_matching_module<'a>(
    modules: &'a [Module],
    module_prefix: &str,
) -> Result<Option<&'a Module>> {
    // Shared libraries are distributed under decorated names (`libc-2.31.so`,
    // `libdl.so.2`). Admitting version and extension decoration after the
    // prefix avoids hard-coding versions while still rejecting modules that
    // continue with letters, like `libc-helper-1.so`.
    let pattern = format!("^{}[.\\-0-9]*(so)?[.\\-0-9]*$", regex::escape(module_prefix));
    let matcher = Regex::new(&pattern).wrap_err("failed to compile module name pattern")?;
    let mut found = None;
    for module in modules {
        if matcher.is_match(&module.name) {
            found = Some(module);
        }
    }
    Ok(found)
}

/// The file-level virtual address the object was linked at.
///
/// Subtracted when composing runtime addresses; zero for the usual
/// position-independent shared object.
fn load_bias(elf: &goblin::elf::Elf) -> u64 {
    elf.program_headers
        .iter()
        .find(|header| header.p_type == PT_LOAD)
        .map_or(0, |header| header.p_vaddr - header.p_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn module(name: &str, address_start: u64) -> Module {
        Module {
            name: name.to_string(),
            file_path: PathBuf::from(format!("/usr/lib/{name}")),
            address_start,
        }
    }

    fn matches(prefix: &str, name: &str) -> bool {
        let modules = [module(name, 0x1000)];
        last_matching_module(&modules, prefix)
            .expect("pattern should compile")
            .is_some()
    }

    #[test]
    fn module_pattern_accepts_decorated_names() {
        assert!(matches("libc", "libc"));
        assert!(matches("libc", "libc-2.31.so"));
        assert!(matches("libc", "libc1.so"));
        assert!(matches("libc", "libcso-9-2"));
        assert!(matches("libc", "libc.so.6"));
        assert!(matches("libdl", "libdl.so.2"));
    }

    #[test]
    fn module_pattern_rejects_unrelated_names() {
        assert!(!matches("libc", "libc-something-3.14.so"));
        assert!(!matches("libc", "i-am-not-libc-2.31.so"));
        assert!(!matches("libc", "libcd"));
        assert!(!matches("libc", "libcrypto.so.3"));
    }

    #[test]
    fn metacharacters_in_prefix_are_literal() {
        assert!(matches("libstdc++", "libstdc++.so.6"));
        assert!(!matches("libstdc..", "libstdc++.so.6"));
    }

    #[test]
    fn last_match_wins() {
        let modules = [
            module("libfoo.so", 0x1000),
            module("libc.so.6", 0x2000),
            module("libc-2.31.so", 0x3000),
        ];
        let found = last_matching_module(&modules, "libc")
            .expect("pattern should compile")
            .expect("a module should match");
        assert_eq!(found.address_start, 0x3000);
    }

    #[test]
    fn fallback_error_names_every_candidate() {
        let process = Process::current().expect("should find own process");
        let error = find_function_address_with_fallback(
            &process,
            &[
                ("frobnicate", "zzz_no_such_module"),
                ("frobnicate_fallback", "also_missing"),
            ],
        )
        .expect_err("no candidate should resolve");
        let message = format!("{error:#}");
        assert!(message.contains("frobnicate"));
        assert!(message.contains("zzz_no_such_module"));
        assert!(message.contains("frobnicate_fallback"));
        assert!(message.contains("also_missing"));
    }
}
