use crate::error::Result;

/// Size of one peek, in bytes. Profiler and target share a word size.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Read access to another process's virtual memory.
///
/// Addresses are plain `u64` values that are only meaningful inside the
/// target; all pointer chasing goes through these primitives and the
/// per-ABI offset tables, never through host pointers.
pub trait Mem {
    /// Read one word at `addr`.
    fn peek_word(&self, addr: u64) -> Result<u64>;

    /// Read `len` bytes starting at `addr`. The read is performed in whole
    /// words, so the returned buffer is `len` rounded up to a word multiple.
    fn peek_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let rounded = len.div_ceil(WORD_SIZE) * WORD_SIZE;
        let mut bytes = Vec::with_capacity(rounded);
        let mut off = 0;
        while off < rounded {
            let word = self.peek_word(addr + off as u64)?;
            bytes.extend_from_slice(&word.to_ne_bytes()[..WORD_SIZE]);
            off += WORD_SIZE;
        }
        Ok(bytes)
    }

    /// Read a NUL-terminated byte string starting at `addr`. Words are
    /// appended until one contains a zero byte; the prefix before it is
    /// returned.
    fn peek_cstring(&self, addr: u64) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut off = 0u64;
        loop {
            let word = self.peek_word(addr + off)?;
            for byte in &word.to_ne_bytes()[..WORD_SIZE] {
                if *byte == 0 {
                    return Ok(bytes);
                }
                bytes.push(*byte);
            }
            off += WORD_SIZE as u64;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::ProfileError;
    use nix::errno::Errno;
    use std::collections::HashMap;

    /// Word-addressable fake of a target's address space for decoder and
    /// walker tests.
    #[derive(Default)]
    pub struct FakeMem {
        bytes: HashMap<u64, u8>,
    }

    impl FakeMem {
        pub fn put_bytes(&mut self, addr: u64, data: &[u8]) {
            for (i, b) in data.iter().enumerate() {
                self.bytes.insert(addr + i as u64, *b);
            }
        }

        pub fn put_word(&mut self, addr: u64, value: u64) {
            self.put_bytes(addr, &value.to_ne_bytes());
        }
    }

    impl Mem for FakeMem {
        fn peek_word(&self, addr: u64) -> Result<u64> {
            let mut buf = [0u8; 8];
            for (i, slot) in buf.iter_mut().enumerate().take(WORD_SIZE) {
                match self.bytes.get(&(addr + i as u64)) {
                    Some(b) => *slot = *b,
                    None => {
                        return Err(ProfileError::PeekFail {
                            addr,
                            errno: Errno::EFAULT,
                        })
                    }
                }
            }
            Ok(u64::from_ne_bytes(buf))
        }
    }

    #[test]
    fn cstring_stops_at_embedded_nul() {
        let mut mem = FakeMem::default();
        mem.put_bytes(0x1000, b"dijkstra.py\0junk");
        assert_eq!(mem.peek_cstring(0x1000).unwrap(), b"dijkstra.py");
    }

    #[test]
    fn bytes_round_up_to_word() {
        let mut mem = FakeMem::default();
        mem.put_bytes(0x1000, b"0123456789abcdef");
        let got = mem.peek_bytes(0x1000, 3).unwrap();
        assert_eq!(got.len(), WORD_SIZE);
        assert_eq!(&got[..3], b"012");
    }

    #[test]
    fn unmapped_read_is_peek_fail() {
        let mem = FakeMem::default();
        assert!(matches!(
            mem.peek_word(0xdead),
            Err(ProfileError::PeekFail { .. })
        ));
    }
}
