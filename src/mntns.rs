use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;
use tracing::{debug, warn};

const PROFILER_MNT: &str = "/proc/self/ns/mnt";

/// Opens paths as the target process sees them.
///
/// If the target lives in a different mount namespace (a container, a
/// chroot), `open` enters the target's namespace for the duration of the
/// call and switches back on every exit path. When both processes share a
/// namespace the bridge holds no descriptors and `open` is a plain open.
pub struct MountNamespace {
    /// (profiler's namespace, target's namespace), or None when they are
    /// the same.
    fds: Option<(File, File)>,
}

impl MountNamespace {
    pub fn for_pid(pid: Pid) -> Self {
        let theirs_path = format!("/proc/{pid}/ns/mnt");
        match Self::compare_namespaces(&theirs_path) {
            Ok(true) => MountNamespace { fds: None },
            Ok(false) => match Self::open_pair(&theirs_path) {
                Ok(fds) => MountNamespace { fds: Some(fds) },
                Err(e) => {
                    warn!("failed to open mount namespace descriptors: {e}");
                    MountNamespace { fds: None }
                }
            },
            Err(e) => {
                // No namespace support on this kernel; still make an attempt
                // to work.
                debug!("mount namespace comparison failed: {e}");
                MountNamespace { fds: None }
            }
        }
    }

    /// True when the target's mount namespace link is the same as ours.
    fn compare_namespaces(theirs_path: &str) -> io::Result<bool> {
        let ours_meta = fs::symlink_metadata(PROFILER_MNT)?;
        if ours_meta.file_type().is_symlink() {
            // Since Linux 3.8 the ns files are magic symlinks whose targets
            // name the namespace.
            let ours = fs::read_link(PROFILER_MNT)?;
            let theirs = fs::read_link(theirs_path)?;
            Ok(ours == theirs)
        } else {
            // Older kernels expose hard links; compare inode identity.
            let theirs_meta = fs::symlink_metadata(theirs_path)?;
            Ok(ours_meta.ino() == theirs_meta.ino())
        }
    }

    fn open_pair(theirs_path: &str) -> io::Result<(File, File)> {
        let ours = File::open(PROFILER_MNT)?;
        let theirs = File::open(theirs_path)?;
        Ok((ours, theirs))
    }

    /// Open `path` in the target's mount namespace. The profiler is back in
    /// its own namespace by the time this returns, whether or not the open
    /// succeeded.
    pub fn open(&self, path: &Path) -> io::Result<File> {
        let Some((ours, theirs)) = &self.fds else {
            return File::open(path);
        };

        setns(theirs, CloneFlags::CLONE_NEWNS).map_err(io::Error::from)?;
        let opened = File::open(path);
        // Re-entering our own namespace must happen even when the open
        // failed; being stranded in the target's namespace is much worse
        // than losing one sample.
        setns(ours, CloneFlags::CLONE_NEWNS).map_err(io::Error::from)?;
        opened
    }

    /// Whether the bridge actually crosses namespaces.
    pub fn is_cross_namespace(&self) -> bool {
        self.fds.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn same_namespace_bridge_is_inert() {
        let ns = MountNamespace::for_pid(Pid::from_raw(std::process::id() as i32));
        assert!(!ns.is_cross_namespace());
    }

    #[test]
    fn open_works_and_leaves_namespace_alone() {
        let before = fs::read_link(PROFILER_MNT).unwrap();
        let ns = MountNamespace::for_pid(Pid::from_raw(std::process::id() as i32));
        let file = ns.open(&PathBuf::from("/proc/self/exe")).unwrap();
        assert!(file.metadata().unwrap().len() > 0);
        assert!(ns.open(&PathBuf::from("/nonexistent-pyflare")).is_err());
        let after = fs::read_link(PROFILER_MNT).unwrap();
        assert_eq!(before, after);
    }
}
