use crate::abi::{
    PyAbi, UNICODE_ASCII_DATA, UNICODE_COMPACT_DATA, UNICODE_LENGTH, UNICODE_STATE,
};
use crate::error::{ProfileError, Result};
use crate::mem::Mem;

/// Sizes read out of the target are untrusted; mask them the way the
/// interpreter's own `int` fields truncate.
const INT_MAX: u64 = i32::MAX as u64;

/// Read the length of a byte-string object (PyStringObject on the 2 line,
/// PyBytesObject on the 3 line); both keep it in `ob_size`.
pub fn bytes_object_len(mem: &impl Mem, abi: PyAbi, addr: u64) -> Result<usize> {
    let offsets = abi.offsets();
    Ok((mem.peek_word(addr + offsets.bytes_size)? & INT_MAX) as usize)
}

/// Read the inline character data of a byte-string object verbatim.
pub fn read_bytes_object(mem: &impl Mem, abi: PyAbi, addr: u64) -> Result<Vec<u8>> {
    let offsets = abi.offsets();
    let len = bytes_object_len(mem, abi, addr)?;
    let mut data = mem.peek_bytes(addr + offsets.bytes_data, len)?;
    data.truncate(len);
    Ok(data)
}

/// Decode an interpreter string object into text.
///
/// On the 2 line these are plain byte strings and come back verbatim. On
/// the 3 line they are compact unicode objects: the state bitfield tells
/// us the character width (1, 2 or 4 bytes per code point) and whether the
/// data starts right after the ASCII header or after the larger compact
/// header, and the code points are re-encoded as UTF-8.
pub fn read_string(mem: &impl Mem, abi: PyAbi, addr: u64) -> Result<String> {
    match abi {
        PyAbi::Unknown | PyAbi::V26 => {
            let bytes = read_bytes_object(mem, abi, addr)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        PyAbi::V34 | PyAbi::V36 | PyAbi::V37 => read_compact_unicode(mem, addr),
    }
}

fn read_compact_unicode(mem: &impl Mem, addr: u64) -> Result<String> {
    let state = mem.peek_word(addr + UNICODE_STATE)? as u32;
    let kind = (state >> 2) & 0x7;
    let compact = (state >> 5) & 1 == 1;
    let ascii = (state >> 6) & 1 == 1;
    let len = (mem.peek_word(addr + UNICODE_LENGTH)? & INT_MAX) as usize;

    if !compact {
        // Legacy (non-compact) unicode objects keep their data behind
        // another pointer; the interpreter only produces them through
        // deprecated C APIs that code objects never use.
        return Err(ProfileError::Fatal(format!(
            "non-compact unicode object at {addr:#x}"
        )));
    }

    let data_addr = addr
        + if ascii {
            UNICODE_ASCII_DATA
        } else {
            UNICODE_COMPACT_DATA
        };

    let raw = mem.peek_bytes(data_addr, len * kind as usize)?;
    let mut out = String::with_capacity(len);
    match kind {
        1 => {
            // One-byte kind is latin-1, of which ASCII is the common case.
            for byte in &raw[..len] {
                out.push(*byte as char);
            }
        }
        2 => {
            for unit in raw[..len * 2].chunks_exact(2) {
                let point = u16::from_le_bytes([unit[0], unit[1]]) as u32;
                out.push(code_point(point, addr)?);
            }
        }
        4 => {
            for unit in raw[..len * 4].chunks_exact(4) {
                let point = u32::from_le_bytes([unit[0], unit[1], unit[2], unit[3]]);
                out.push(code_point(point, addr)?);
            }
        }
        other => {
            return Err(ProfileError::Fatal(format!(
                "unicode object at {addr:#x} has impossible kind {other}"
            )));
        }
    }
    Ok(out)
}

fn code_point(point: u32, addr: u64) -> Result<char> {
    // The interpreter stores supplementary-plane characters with the
    // 4-byte kind instead of surrogate pairs, so a surrogate here means
    // our ABI guess is wrong or the object was torn mid-read.
    assert!(
        !(0xD800..=0xDFFF).contains(&point),
        "surrogate code point {point:#x} in interpreter string at {addr:#x}"
    );
    char::from_u32(point).ok_or_else(|| {
        ProfileError::Fatal(format!(
            "invalid code point {point:#x} in string object at {addr:#x}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::V34_OFFSETS;
    use crate::mem::testing::FakeMem;
    use rstest::rstest;

    const OBJ: u64 = 0x7000;

    fn py2_string(mem: &mut FakeMem, addr: u64, data: &[u8]) {
        let offsets = PyAbi::V26.offsets();
        mem.put_word(addr + offsets.bytes_size, data.len() as u64);
        mem.put_bytes(addr + offsets.bytes_data, data);
        // The rounded-up word read may run past the data.
        mem.put_bytes(addr + offsets.bytes_data + data.len() as u64, &[0; 8]);
    }

    fn py3_unicode(mem: &mut FakeMem, addr: u64, kind: u32, ascii: bool, units: &[u32]) {
        let state = (kind << 2) | (1 << 5) | ((ascii as u32) << 6);
        mem.put_word(addr + UNICODE_STATE, state as u64);
        mem.put_word(addr + UNICODE_LENGTH, units.len() as u64);
        let data = addr + if ascii { UNICODE_ASCII_DATA } else { UNICODE_COMPACT_DATA };
        let mut bytes = Vec::new();
        for unit in units {
            bytes.extend_from_slice(&unit.to_le_bytes()[..kind as usize]);
        }
        bytes.extend_from_slice(&[0; 8]);
        mem.put_bytes(data, &bytes);
    }

    #[test]
    fn byte_string_round_trips() {
        let mut mem = FakeMem::default();
        py2_string(&mut mem, OBJ, b"dijkstra.py");
        assert_eq!(read_string(&mem, PyAbi::V26, OBJ).unwrap(), "dijkstra.py");
        assert_eq!(
            read_bytes_object(&mem, PyAbi::V26, OBJ).unwrap(),
            b"dijkstra.py"
        );
    }

    #[test]
    fn lnotab_bytes_use_python3_data_offset() {
        let mut mem = FakeMem::default();
        mem.put_word(OBJ + V34_OFFSETS.bytes_size, 4);
        mem.put_bytes(OBJ + V34_OFFSETS.bytes_data, &[6, 1, 8, 2, 0, 0, 0, 0]);
        assert_eq!(
            read_bytes_object(&mem, PyAbi::V34, OBJ).unwrap(),
            vec![6, 1, 8, 2]
        );
    }

    #[rstest]
    #[case::ascii(1, true, "spin")]
    #[case::latin1(1, false, "café")]
    #[case::two_byte(2, false, "πλάτων")]
    #[case::four_byte(4, false, "x😀y")]
    fn compact_unicode_decodes(#[case] kind: u32, #[case] ascii: bool, #[case] text: &str) {
        let mut mem = FakeMem::default();
        let units: Vec<u32> = text.chars().map(|c| c as u32).collect();
        py3_unicode(&mut mem, OBJ, kind, ascii, &units);
        for abi in [PyAbi::V34, PyAbi::V36, PyAbi::V37] {
            assert_eq!(read_string(&mem, abi, OBJ).unwrap(), text);
        }
    }

    #[test]
    fn non_compact_unicode_is_rejected() {
        let mut mem = FakeMem::default();
        // kind 1, compact bit clear
        mem.put_word(OBJ + UNICODE_STATE, 1 << 2);
        mem.put_word(OBJ + UNICODE_LENGTH, 1);
        assert!(read_string(&mem, PyAbi::V36, OBJ).is_err());
    }

    #[test]
    #[should_panic(expected = "surrogate code point")]
    fn surrogates_are_asserted_absent() {
        let mut mem = FakeMem::default();
        py3_unicode(&mut mem, OBJ, 2, false, &[0xD83D]);
        let _ = read_string(&mem, PyAbi::V36, OBJ);
    }
}
