use std::ffi::CString;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{ProfileError, Result};
use crate::mem::Mem;

#[cfg(target_arch = "x86_64")]
use libc::user_regs_struct;

/// x86 encoding of SYSCALL, poked over the target's current instruction
/// when we need it to run mmap/munmap for us.
#[cfg(target_arch = "x86_64")]
const SYSCALL_INSN: u64 = 0x050f;

/// `call rax; int3`, the whole body of the scratch page.
#[cfg(target_arch = "x86_64")]
const TRAMPOLINE: u64 = u64::from_le_bytes([0xff, 0xd0, 0xcc, 0, 0, 0, 0, 0]);

fn ptrace_err(op: &'static str, errno: Errno) -> ProfileError {
    if errno == Errno::ESRCH {
        ProfileError::TargetTerminated
    } else {
        ProfileError::Ptrace { op, errno }
    }
}

/// A process under our ptrace control.
///
/// Holds the one piece of cross-call state the control plane needs: the
/// address of the scratch page we may have mapped into the target for
/// synthesized function calls. Keeping it here rather than in module state
/// makes teardown explicit and multiple concurrent sessions safe.
pub struct Tracee {
    pid: Pid,
    scratch_page: Option<u64>,
}

impl Tracee {
    /// Bring `pid` under our control with PTRACE_SEIZE, which (unlike
    /// PTRACE_ATTACH) lets us group-stop the target later without a signal
    /// the target could observe.
    pub fn seize(pid: Pid) -> Result<Self> {
        ptrace::seize(pid, Options::empty()).map_err(|errno| match errno {
            Errno::EPERM => ProfileError::Fatal(format!(
                "failed to seize pid {pid}: permission denied (are you the same user, or root?)"
            )),
            Errno::ESRCH => ProfileError::Fatal(format!("no such process: {pid}")),
            errno => ProfileError::Fatal(format!("failed to seize pid {pid}: {errno}")),
        })?;
        Ok(Tracee {
            pid,
            scratch_page: None,
        })
    }

    /// Fork and exec `argv` under trace. The child is held until it has
    /// actually exec'ed the new image (there is no point probing for
    /// interpreter symbols before that), then re-attached with seize so the
    /// group-stop machinery works.
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let cargs: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()).map_err(|_| {
                ProfileError::Fatal(format!("argument contains NUL byte: {a:?}"))
            }))
            .collect::<Result<_>>()?;

        match unsafe { nix::unistd::fork() } {
            Err(errno) => Err(ProfileError::Fatal(format!("fork failed: {errno}"))),
            Ok(nix::unistd::ForkResult::Child) => {
                // In the child: request tracing, stop, and exec. Any failure
                // here can only be reported by dying.
                let _ = ptrace::traceme();
                let _ = nix::sys::signal::raise(Signal::SIGSTOP);
                let _ = nix::unistd::execvp(&cargs[0], &cargs);
                std::process::exit(1);
            }
            Ok(nix::unistd::ForkResult::Parent { child }) => {
                Self::await_exec(child)?;
                // PTRACE_INTERRUPT only works on seized processes, so drop
                // the classic attach from TRACEME and seize instead.
                ptrace::detach(child, None).map_err(|e| ptrace_err("detach", e))?;
                Self::seize(child)
            }
        }
    }

    /// Wait until the freshly forked child reports its exec event.
    fn await_exec(child: Pid) -> Result<()> {
        match waitpid(child, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            Ok(other) => {
                return Err(ProfileError::UnexpectedStatus(format!("{other:?}")));
            }
            Err(errno) => return Err(ptrace_err("waitpid", errno)),
        }
        ptrace::setoptions(child, Options::PTRACE_O_TRACEEXEC)
            .map_err(|e| ptrace_err("setoptions", e))?;
        ptrace::cont(child, None).map_err(|e| ptrace_err("cont", e))?;
        loop {
            match waitpid(child, None) {
                Ok(WaitStatus::PtraceEvent(_, _, event))
                    if event == libc::PTRACE_EVENT_EXEC =>
                {
                    return Ok(());
                }
                Ok(WaitStatus::Exited(_, status)) => {
                    return Err(ProfileError::Fatal(format!(
                        "child exited with status {status} before exec"
                    )));
                }
                Ok(WaitStatus::Signaled(..)) => return Err(ProfileError::TargetTerminated),
                Ok(_) => {
                    ptrace::cont(child, None).map_err(|e| ptrace_err("cont", e))?;
                }
                Err(errno) => return Err(ptrace_err("waitpid", errno)),
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Group-stop the target and wait until it reports stopped. Idempotent
    /// while the target is already stopped.
    pub fn interrupt(&self) -> Result<()> {
        ptrace::interrupt(self.pid).map_err(|e| ptrace_err("interrupt", e))?;
        wait_for_stop(self.pid)
    }

    /// Let the target run again.
    pub fn resume(&self) -> Result<()> {
        ptrace::cont(self.pid, None).map_err(|e| ptrace_err("cont", e))
    }

    /// Release the target. Best-effort: the target may already be gone, and
    /// calling this twice must never fault.
    pub fn detach(&self) {
        if let Err(errno) = ptrace::detach(self.pid, None) {
            debug!("detach of pid {} returned {errno}", self.pid);
        }
    }

    pub fn poke_word(&self, addr: u64, value: u64) -> Result<()> {
        ptrace::write(
            self.pid,
            addr as usize as ptrace::AddressType,
            value as libc::c_long,
        )
        .map_err(|errno| match errno {
            Errno::ESRCH => ProfileError::TargetTerminated,
            errno => ProfileError::PeekFail { addr, errno },
        })
    }

    #[cfg(target_arch = "x86_64")]
    pub fn get_regs(&self) -> Result<user_regs_struct> {
        ptrace::getregs(self.pid).map_err(|e| ptrace_err("getregs", e))
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_regs(&self, regs: user_regs_struct) -> Result<()> {
        ptrace::setregs(self.pid, regs).map_err(|e| ptrace_err("setregs", e))
    }

    /// Execute one instruction and wait for the resulting trap.
    #[cfg(target_arch = "x86_64")]
    pub fn single_step(&self) -> Result<()> {
        ptrace::step(self.pid, None).map_err(|e| ptrace_err("step", e))?;
        wait_for_stop(self.pid)
    }

    /// Make the target call the function at `fn_addr` and return its rax.
    ///
    /// On first use this maps one RWX page into the target by hijacking its
    /// current instruction into a syscall, and writes the call trampoline
    /// into it. The target must be stopped.
    #[cfg(target_arch = "x86_64")]
    pub fn call_function(&mut self, fn_addr: u64) -> Result<u64> {
        let page = match self.scratch_page {
            Some(page) => page,
            None => {
                self.pause_siblings()?;
                let mapped = self.alloc_page();
                self.resume_siblings();
                let page = mapped?;
                if (page as i64) < 0 {
                    return Err(ProfileError::Fatal(
                        "mmap inside the target failed".to_string(),
                    ));
                }
                self.poke_word(page, TRAMPOLINE)?;
                self.scratch_page = Some(page);
                page
            }
        };

        let oldregs = self.get_regs()?;
        let mut newregs = oldregs;
        newregs.rax = fn_addr;
        newregs.rip = page;
        self.set_regs(newregs)?;
        self.resume()?;
        wait_for_stop(self.pid)?;
        let result = self.get_regs()?.rax;
        self.set_regs(oldregs)?;
        Ok(result)
    }

    /// Run `mmap(0, pagesize, RWX, PRIVATE|ANON, -1, 0)` inside the target
    /// by poking a SYSCALL over the current instruction, single-stepping,
    /// and restoring everything.
    #[cfg(target_arch = "x86_64")]
    fn alloc_page(&self) -> Result<u64> {
        let oldregs = self.get_regs()?;
        let orig_code = self.peek_word(oldregs.rip)?;
        self.poke_word(oldregs.rip, SYSCALL_INSN)?;

        let mut newregs = oldregs;
        newregs.rax = libc::SYS_mmap as u64;
        newregs.rdi = 0; // addr
        newregs.rsi = page_size(); // len
        newregs.rdx = (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64; // prot
        newregs.r10 = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64; // flags
        newregs.r8 = -1i64 as u64; // fd
        newregs.r9 = 0; // offset
        self.set_regs(newregs)?;
        self.single_step()?;
        let result = self.get_regs()?.rax;

        self.set_regs(oldregs)?;
        self.poke_word(oldregs.rip, orig_code)?;
        Ok(result)
    }

    /// Stop every sibling task of the target with a classic attach so none
    /// of them can be running while we rewrite code or unmap the scratch
    /// page.
    #[cfg(target_arch = "x86_64")]
    fn pause_siblings(&self) -> Result<()> {
        for tid in list_tasks(self.pid)? {
            if tid == self.pid {
                continue;
            }
            ptrace::attach(tid).map_err(|e| ptrace_err("attach", e))?;
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::PtraceEvent(..)) => {}
                Ok(other) => {
                    return Err(ProfileError::UnexpectedStatus(format!("{other:?}")));
                }
                Err(errno) => return Err(ptrace_err("waitpid", errno)),
            }
        }
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn resume_siblings(&self) {
        match list_tasks(self.pid) {
            Ok(tids) => {
                for tid in tids {
                    if tid != self.pid {
                        let _ = ptrace::detach(tid, None);
                    }
                }
            }
            Err(e) => warn!("failed to list sibling tasks while resuming: {e}"),
        }
    }

    /// Undo everything: unmap the scratch page if one was installed, then
    /// detach. Errors are swallowed; the target may be long gone.
    pub fn teardown(&mut self) {
        #[cfg(target_arch = "x86_64")]
        if let Some(page) = self.scratch_page {
            if let Err(e) = self.unmap_scratch(page) {
                warn!("failed to unmap scratch page in target: {e}");
            } else {
                self.scratch_page = None;
            }
        }
        self.detach();
    }

    #[cfg(target_arch = "x86_64")]
    fn unmap_scratch(&self, page: u64) -> Result<()> {
        let oldregs = self.get_regs()?;
        let orig_code = self.peek_word(oldregs.rip)?;

        let mut newregs = oldregs;
        newregs.rax = libc::SYS_munmap as u64;
        newregs.rdi = page;
        newregs.rsi = page_size();

        self.pause_siblings()?;
        let poked = self.poke_word(oldregs.rip, SYSCALL_INSN);
        let result = poked.and_then(|()| {
            self.set_regs(newregs)?;
            self.single_step()?;
            let rax = self.get_regs()?.rax;
            if rax != 0 {
                warn!("munmap of the trampoline page returned {rax}");
            }
            Ok(())
        });

        // Restore the target no matter how the syscall went.
        let _ = self.poke_word(oldregs.rip, orig_code);
        let _ = self.set_regs(oldregs);
        self.resume_siblings();
        result
    }
}

impl Mem for Tracee {
    fn peek_word(&self, addr: u64) -> Result<u64> {
        ptrace::read(self.pid, addr as usize as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|errno| match errno {
                Errno::ESRCH => ProfileError::TargetTerminated,
                errno => ProfileError::PeekFail { addr, errno },
            })
    }
}

/// Wait for `pid` to enter a trap or group stop. Exit statuses surface as
/// `TargetTerminated`, anything else is unexpected.
fn wait_for_stop(pid: Pid) -> Result<()> {
    match waitpid(pid, Some(WaitPidFlag::__WALL)) {
        Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => Ok(()),
        Ok(WaitStatus::PtraceEvent(_, _, _)) => Ok(()),
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
            Err(ProfileError::TargetTerminated)
        }
        Ok(other) => Err(ProfileError::UnexpectedStatus(format!("{other:?}"))),
        Err(errno) => Err(ptrace_err("waitpid", errno)),
    }
}

/// All task ids of a process, from /proc/<pid>/task.
#[cfg(target_arch = "x86_64")]
fn list_tasks(pid: Pid) -> Result<Vec<Pid>> {
    let dir = format!("/proc/{pid}/task");
    let entries = std::fs::read_dir(&dir).map_err(|e| {
        if e.raw_os_error() == Some(libc::ESRCH) || e.kind() == std::io::ErrorKind::NotFound {
            ProfileError::TargetTerminated
        } else {
            ProfileError::Fatal(format!("failed to list {dir}: {e}"))
        }
    })?;
    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ProfileError::Fatal(format!("readdir {dir}: {e}")))?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }
    Ok(tids)
}

/// Execution access to the target: plain memory reads plus the ability to
/// make the target itself run a function for us. The walker is generic over
/// this so it can be exercised against an in-memory fake.
pub trait Target: Mem {
    fn call_in_target(&mut self, fn_addr: u64) -> Result<u64>;
}

impl Target for Tracee {
    #[cfg(target_arch = "x86_64")]
    fn call_in_target(&mut self, fn_addr: u64) -> Result<u64> {
        self.call_function(fn_addr)
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn call_in_target(&mut self, _fn_addr: u64) -> Result<u64> {
        Err(ProfileError::Fatal(
            "synthesized calls are only supported on amd64".to_string(),
        ))
    }
}

#[cfg(target_arch = "x86_64")]
fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name has no side effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}
