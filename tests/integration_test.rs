use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::unistd::Pid;

use pyflare::error::ProfileError;
use pyflare::maps;
use pyflare::mem::Mem;
use pyflare::tracee::Tracee;

/// Runs a quiet long-lived child and kills it when the scope exits.
struct TestProcess {
    child: Child,
}

impl TestProcess {
    fn sleeper() -> Self {
        Self {
            child: Command::new("sleep")
                .arg("30")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .expect("failed to spawn sleep(1)"),
        }
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

impl Drop for TestProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Sandboxed CI environments sometimes deny ptrace entirely; in that case
/// there is nothing useful these tests can do.
fn seize_or_skip(pid: Pid) -> Option<Tracee> {
    match Tracee::seize(pid) {
        Ok(tracee) => Some(tracee),
        Err(ProfileError::Fatal(msg)) if msg.contains("permission denied") => {
            eprintln!("skipping: ptrace is not permitted here ({msg})");
            None
        }
        Err(e) => panic!("unexpected seize failure: {e}"),
    }
}

#[test]
fn seize_interrupt_peek_resume() {
    let target = TestProcess::sleeper();
    // Give the child a moment to exec.
    std::thread::sleep(Duration::from_millis(100));

    let Some(tracee) = seize_or_skip(target.pid()) else {
        return;
    };
    tracee.interrupt().unwrap();

    // Any mapping of the child's executable is readable word by word.
    let loaded = maps::locate_shared_object(target.pid(), "/")
        .unwrap()
        .expect("child has no file-backed mappings");
    let word = tracee.peek_word(loaded.load_offset).unwrap();
    // The ELF magic is at the start of the lowest mapping.
    assert_eq!(word as u32, u32::from_le_bytes(*b"\x7fELF"));

    tracee.resume().unwrap();
}

#[test]
fn detach_is_idempotent() {
    let target = TestProcess::sleeper();
    std::thread::sleep(Duration::from_millis(100));

    let Some(tracee) = seize_or_skip(target.pid()) else {
        return;
    };
    tracee.interrupt().unwrap();
    tracee.detach();
    tracee.detach();
}

#[test]
fn peek_of_unmapped_address_is_nonfatal() {
    let target = TestProcess::sleeper();
    std::thread::sleep(Duration::from_millis(100));

    let Some(tracee) = seize_or_skip(target.pid()) else {
        return;
    };
    tracee.interrupt().unwrap();
    match tracee.peek_word(0x10) {
        Err(ProfileError::PeekFail { addr: 0x10, .. }) => {}
        other => panic!("expected PeekFail, got {other:?}"),
    }
    tracee.resume().unwrap();
}
