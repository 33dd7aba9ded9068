use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::{ProfileError, Result};

/// Where a file landed in the target's address space: the lowest mapped
/// virtual address (the ASLR load offset to add to in-file symbol values)
/// and the absolute path it was mapped from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedObject {
    pub load_offset: u64,
    pub path: PathBuf,
}

/// Scan `/proc/<pid>/maps` for the first mapping whose file name contains
/// `hint`. Returns None when nothing matches, which callers treat as "the
/// library is not loaded yet".
pub fn locate_shared_object(pid: Pid, hint: &str) -> Result<Option<LoadedObject>> {
    let path = format!("/proc/{pid}/maps");
    let file = File::open(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ProfileError::TargetTerminated
        } else {
            ProfileError::Fatal(format!("failed to open {path}: {e}"))
        }
    })?;
    find_mapping(BufReader::new(file), hint)
}

/// The parsing core, split out so it can run against fixture text. Map
/// lines look like `start-end perms offset dev inode path`.
pub fn find_mapping<R: BufRead>(reader: R, hint: &str) -> Result<Option<LoadedObject>> {
    for line in reader.lines() {
        let line =
            line.map_err(|e| ProfileError::Fatal(format!("failed to read maps file: {e}")))?;
        if !line.contains(hint) {
            continue;
        }
        let path_start = line.find('/').ok_or_else(|| {
            ProfileError::Fatal(format!("maps entry matching {hint:?} has no absolute path"))
        })?;
        let dash = line.find('-').ok_or_else(|| {
            ProfileError::Fatal(format!("maps entry matching {hint:?} has no address range"))
        })?;
        let load_offset = u64::from_str_radix(&line[..dash], 16).map_err(|e| {
            ProfileError::Fatal(format!("bad start address in maps entry: {e}"))
        })?;
        return Ok(Some(LoadedObject {
            load_offset,
            path: PathBuf::from(&line[path_start..]),
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAPS: &str = "\
55d6ad20a000-55d6ad20b000 r--p 00000000 fd:01 5505025 /usr/bin/python2.7
55d6ad20b000-55d6ad5f2000 r-xp 00001000 fd:01 5505025 /usr/bin/python2.7
7f30c94ff000-7f30c9524000 r--p 00000000 fd:01 5510001 /usr/lib/libpython2.7.so.1.0
7f30c9524000-7f30c9680000 r-xp 00025000 fd:01 5510001 /usr/lib/libpython2.7.so.1.0
7ffd8e9f0000-7ffd8ea11000 rw-p 00000000 00:00 0       [stack]
";

    #[test]
    fn finds_first_matching_line() {
        let found = find_mapping(Cursor::new(MAPS), "libpython")
            .unwrap()
            .unwrap();
        assert_eq!(found.load_offset, 0x7f30c94ff000);
        assert_eq!(
            found.path,
            PathBuf::from("/usr/lib/libpython2.7.so.1.0")
        );
    }

    #[test]
    fn exe_hint_matches_lowest_mapping() {
        let found = find_mapping(Cursor::new(MAPS), "/usr/bin/python2.7")
            .unwrap()
            .unwrap();
        assert_eq!(found.load_offset, 0x55d6ad20a000);
    }

    #[test]
    fn missing_library_is_none() {
        assert_eq!(find_mapping(Cursor::new(MAPS), "libruby").unwrap(), None);
    }

    #[test]
    fn pathless_match_is_an_error() {
        let maps = "7ffd8e9f0000-7ffd8ea11000 rw-p 00000000 00:00 0 [stack]\n";
        assert!(find_mapping(Cursor::new(maps), "[stack]").is_err());
    }
}
