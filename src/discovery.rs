use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use tracing::{debug, warn};

use pyflare_object::{ObjectFile, SymbolTableKind};

use crate::abi::{PyAbi, RUNTIME_INTERP_HEAD, RUNTIME_TSTATE_CURRENT};
use crate::error::{ProfileError, Result};
use crate::maps;
use crate::mntns::MountNamespace;

/// Everything we know about where the interpreter keeps its globals inside
/// the target. Absolute virtual addresses after the load offset has been
/// applied; zero means "not found".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpreterAddresses {
    /// The current-thread-state pointer (`_PyThreadState_Current`, or the
    /// equivalent slot inside `_PyRuntime` on 3.7).
    pub tstate_addr: u64,
    /// `_PyThreadState_UncheckedGet`, callable when the pointer is unset.
    pub tstate_get_fn_addr: u64,
    /// The static `interp_head` list head. Not part of the dynamic symbol
    /// table, so stripping removes it.
    pub interp_head_addr: u64,
    /// The public `PyInterpreterState_Head` accessor function.
    pub interp_head_fn_addr: u64,
    /// An interpreter-state address obtained by actually calling the
    /// accessor inside the target.
    pub interp_head_hint: u64,
    /// Whether the object the symbols came from is position independent.
    pub pie: bool,
}

impl InterpreterAddresses {
    /// Resolution succeeded if we can reach a thread state one way or the
    /// other.
    pub fn usable(&self) -> bool {
        self.tstate_addr != 0 || self.tstate_get_fn_addr != 0
    }

    /// Shift every found address by the ASLR load offset. The hint is a
    /// runtime value, never shifted.
    fn offset_by(mut self, base: u64) -> Self {
        for addr in [
            &mut self.tstate_addr,
            &mut self.tstate_get_fn_addr,
            &mut self.interp_head_addr,
            &mut self.interp_head_fn_addr,
        ] {
            if *addr != 0 {
                *addr = addr.wrapping_add(base);
            }
        }
        self
    }
}

/// Scan one ELF object's symbol tables for the interpreter globals and the
/// ABI marker symbols.
fn scan_object(object: &ObjectFile) -> Result<(InterpreterAddresses, PyAbi)> {
    let mut addrs = InterpreterAddresses::default();
    let mut abi = PyAbi::Unknown;
    let mut runtime_addr = 0u64;

    let mut visit = |name: &[u8], value: u64| {
        if value == 0 {
            return;
        }
        match name {
            b"_PyThreadState_Current" => {
                if addrs.tstate_addr == 0 {
                    addrs.tstate_addr = value;
                }
            }
            b"_PyThreadState_UncheckedGet" => {
                if addrs.tstate_get_fn_addr == 0 {
                    addrs.tstate_get_fn_addr = value;
                }
            }
            b"interp_head" => {
                if addrs.interp_head_addr == 0 {
                    addrs.interp_head_addr = value;
                }
            }
            b"PyInterpreterState_Head" => {
                if addrs.interp_head_fn_addr == 0 {
                    addrs.interp_head_fn_addr = value;
                }
            }
            b"_PyRuntime" => {
                if runtime_addr == 0 {
                    runtime_addr = value;
                }
            }
            b"PyString_Type" => abi = abi.refine(PyAbi::V26),
            b"PyBytes_Type" => abi = abi.refine(PyAbi::V34),
            b"_PyEval_RequestCodeExtraIndex" | b"_PyCode_GetExtra" | b"_PyCode_SetExtra" => {
                abi = abi.refine(PyAbi::V36)
            }
            b"Py_UTF8Mode" => abi = abi.refine(PyAbi::V37),
            _ => {}
        }
    };

    let to_fatal = |e: anyhow::Error| ProfileError::Fatal(format!("failed to walk symbols: {e}"));
    object
        .visit_symbols(SymbolTableKind::Dynamic, &mut visit)
        .map_err(to_fatal)?;
    object
        .visit_symbols(SymbolTableKind::Debug, &mut visit)
        .map_err(to_fatal)?;

    // 3.7 moved the interpreter globals into one big runtime structure;
    // reconstruct the old addresses from its known field offsets.
    if abi == PyAbi::V37 && runtime_addr != 0 {
        if addrs.tstate_addr == 0 {
            addrs.tstate_addr = runtime_addr + RUNTIME_TSTATE_CURRENT;
        }
        if addrs.interp_head_addr == 0 {
            addrs.interp_head_addr = runtime_addr + RUNTIME_INTERP_HEAD;
        }
    }

    addrs.pie = object
        .is_dynamic()
        .map_err(|e| ProfileError::Fatal(format!("failed to read ELF type: {e}")))?;

    // Position-independent objects carry offsets, not addresses; normalize
    // against the image base so the map offset can simply be added.
    if addrs.pie {
        let base = object
            .base_load_address()
            .map_err(|e| ProfileError::Fatal(format!("failed to read load segments: {e}")))?;
        if base != 0 {
            addrs = addrs.offset_by(base.wrapping_neg());
        }
    }

    Ok((addrs, abi))
}

fn open_object(ns: &MountNamespace, path: &Path) -> Result<ObjectFile> {
    let file = ns
        .open(path)
        .map_err(|e| ProfileError::Fatal(format!("failed to open {}: {e}", path.display())))?;
    ObjectFile::from_file(&file)
        .map_err(|e| ProfileError::Fatal(format!("failed to parse {}: {e}", path.display())))
}

/// Resolve symbols out of a shared object loaded by the target, located by
/// a substring of its name.
fn from_shared_object(
    pid: Pid,
    ns: &MountNamespace,
    hint: &str,
) -> Result<(InterpreterAddresses, PyAbi)> {
    let Some(loaded) = maps::locate_shared_object(pid, hint)? else {
        debug!("no mapping matching {hint:?} in pid {pid}");
        return Err(ProfileError::SymbolsNotLoaded);
    };
    let object = open_object(ns, &loaded.path)?;
    let (addrs, abi) = scan_object(&object)?;
    if !addrs.usable() {
        return Err(ProfileError::SymbolsNotLoaded);
    }
    Ok((addrs.offset_by(loaded.load_offset), abi))
}

/// Locate the interpreter globals in `pid` and detect its ABI.
///
/// Looks in the executable itself first (the common distro build links the
/// interpreter statically), then in whichever `DT_NEEDED` entry looks like
/// libpython, and as a last resort guesses the legacy soname for targets
/// that only pull the runtime in via dlopen. A forced ABI wins over
/// detection even when it is wrong.
pub fn resolve(
    pid: Pid,
    ns: &MountNamespace,
    forced_abi: PyAbi,
) -> Result<(InterpreterAddresses, PyAbi)> {
    let exe_link = format!("/proc/{pid}/exe");
    let exe: PathBuf = fs::read_link(&exe_link).map_err(|e| {
        if e.raw_os_error() == Some(libc::ESRCH) || e.kind() == std::io::ErrorKind::NotFound {
            ProfileError::TargetTerminated
        } else {
            ProfileError::Fatal(format!("failed to read {exe_link}: {e}"))
        }
    })?;

    let object = open_object(ns, &exe)?;
    let (mut addrs, mut abi) = scan_object(&object)?;

    if addrs.usable() {
        if addrs.pie {
            // The executable itself was loaded at a randomized base; find
            // it in the map the same way we would a shared object.
            let exe_str = exe.to_string_lossy();
            let Some(loaded) = maps::locate_shared_object(pid, &exe_str)? else {
                return Err(ProfileError::SymbolsNotLoaded);
            };
            addrs = addrs.offset_by(loaded.load_offset);
        }
    } else {
        let needed = object
            .needed_libraries()
            .map_err(|e| ProfileError::Fatal(format!("failed to read DT_NEEDED: {e}")))?;
        let result = match needed.iter().find(|lib| lib.contains("libpython")) {
            Some(libpython) => from_shared_object(pid, ns, libpython),
            // Processes like uwsgi dlopen() the runtime, so there is no
            // DT_NEEDED entry to follow; guess the legacy soname.
            None => from_shared_object(pid, ns, "libpython2.7.so"),
        };
        (addrs, abi) = result?;
    }

    if !addrs.usable() {
        return Err(ProfileError::SymbolsNotLoaded);
    }

    if forced_abi != PyAbi::Unknown {
        if abi != PyAbi::Unknown && abi != forced_abi {
            warn!("detected ABI {abi:?} but honoring forced {forced_abi:?}");
        }
        abi = forced_abi;
    }
    if abi == PyAbi::Unknown {
        return Err(ProfileError::Fatal(
            "failed to detect a Python ABI in the target".to_string(),
        ));
    }

    debug!(?abi, ?addrs, "resolved interpreter addresses");
    Ok((addrs, abi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_requires_a_thread_state_route() {
        let mut addrs = InterpreterAddresses::default();
        assert!(!addrs.usable());
        addrs.interp_head_addr = 0x1000;
        assert!(!addrs.usable());
        addrs.tstate_get_fn_addr = 0x2000;
        assert!(addrs.usable());
        addrs = InterpreterAddresses {
            tstate_addr: 0x3000,
            ..Default::default()
        };
        assert!(addrs.usable());
    }

    #[test]
    fn offsets_skip_missing_addresses() {
        let addrs = InterpreterAddresses {
            tstate_addr: 0x100,
            interp_head_fn_addr: 0x200,
            ..Default::default()
        };
        let shifted = addrs.offset_by(0x7f0000000000);
        assert_eq!(shifted.tstate_addr, 0x7f0000000100);
        assert_eq!(shifted.interp_head_fn_addr, 0x7f0000000200);
        assert_eq!(shifted.tstate_get_fn_addr, 0);
        assert_eq!(shifted.interp_head_addr, 0);
    }

    #[test]
    fn own_executable_is_not_an_interpreter() {
        // The test binary parses fine but carries no interpreter symbols,
        // which must surface as the retryable error, not a fatal one.
        let pid = Pid::from_raw(std::process::id() as i32);
        let ns = MountNamespace::for_pid(pid);
        match resolve(pid, &ns, PyAbi::Unknown) {
            Err(ProfileError::SymbolsNotLoaded) => {}
            other => panic!("expected SymbolsNotLoaded, got {other:?}"),
        }
    }
}
