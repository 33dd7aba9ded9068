//! Per-ABI layout constants for the interpreter structures we chase.
//!
//! The offsets are derived from the CPython headers of each release line
//! (LP64 targets). Some ABIs span multiple releases; each is named after
//! the first release to introduce it, so `V26` covers 2.6/2.7 and `V34`
//! covers 3.4/3.5.

/// The interpreter ABI in use by the target. Selected once at discovery
/// and fixed for the lifetime of a sampling session.
///
/// Ordering matters: when several marker symbols are present the later,
/// more specific version wins, so refinement is simply `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PyAbi {
    #[default]
    Unknown,
    V26,
    V34,
    V36,
    V37,
}

impl PyAbi {
    /// Fold in a newly observed marker symbol. The Python 2 and Python 3
    /// lines never refine into each other; within the 3 line, later
    /// versions win.
    pub fn refine(self, observed: PyAbi) -> PyAbi {
        match (self, observed) {
            (PyAbi::V26, _) => PyAbi::V26,
            (_, PyAbi::V26) if self != PyAbi::Unknown => self,
            _ => self.max(observed),
        }
    }

    pub fn offsets(self) -> &'static StructOffsets {
        match self {
            // Discovery refuses to hand an Unknown ABI to the walker; the
            // fallback table here is never reached in a running session.
            PyAbi::Unknown | PyAbi::V26 => &V26_OFFSETS,
            PyAbi::V34 => &V34_OFFSETS,
            PyAbi::V36 => &V36_OFFSETS,
            PyAbi::V37 => &V37_OFFSETS,
        }
    }
}

/// Byte offsets into the thread-state, interpreter-state, frame, code and
/// byte-string objects of one ABI.
#[derive(Debug)]
pub struct StructOffsets {
    /// PyThreadState.next
    pub ts_next: u64,
    /// PyThreadState.interp
    pub ts_interp: u64,
    /// PyThreadState.frame
    pub ts_frame: u64,
    /// PyThreadState.thread_id
    pub ts_thread_id: u64,
    /// PyInterpreterState.tstate_head
    pub is_tstate_head: u64,
    /// PyFrameObject.f_back
    pub frame_back: u64,
    /// PyFrameObject.f_code
    pub frame_code: u64,
    /// PyFrameObject.f_trace
    pub frame_trace: u64,
    /// PyFrameObject.f_lasti
    pub frame_lasti: u64,
    /// PyFrameObject.f_lineno
    pub frame_lineno: u64,
    /// PyCodeObject.co_filename
    pub code_filename: u64,
    /// PyCodeObject.co_name
    pub code_name: u64,
    /// PyCodeObject.co_firstlineno
    pub code_firstlineno: u64,
    /// PyCodeObject.co_lnotab
    pub code_lnotab: u64,
    /// ob_size of the byte-string object backing co_lnotab
    /// (PyStringObject on the 2 line, PyBytesObject on the 3 line)
    pub bytes_size: u64,
    /// start of the inline character data of that object
    pub bytes_data: u64,
}

pub static V26_OFFSETS: StructOffsets = StructOffsets {
    ts_next: 0,
    ts_interp: 8,
    ts_frame: 16,
    ts_thread_id: 144,
    is_tstate_head: 8,
    frame_back: 24,
    frame_code: 32,
    frame_trace: 80,
    frame_lasti: 120,
    frame_lineno: 124,
    code_filename: 80,
    code_name: 88,
    code_firstlineno: 96,
    code_lnotab: 104,
    bytes_size: 16,
    bytes_data: 36,
};

// The code object is identical across 3.4, 3.6 and 3.7: the int fields
// (co_flags, co_firstlineno) sit at the front, the object pointers after
// them, so co_lnotab directly follows co_name.
pub static V34_OFFSETS: StructOffsets = StructOffsets {
    // 3.4 grew a `prev` link at the head of the thread state.
    ts_next: 8,
    ts_interp: 16,
    ts_frame: 24,
    ts_thread_id: 152,
    is_tstate_head: 8,
    frame_back: 24,
    frame_code: 32,
    frame_trace: 80,
    frame_lasti: 120,
    frame_lineno: 124,
    code_filename: 96,
    code_name: 104,
    code_firstlineno: 36,
    code_lnotab: 112,
    bytes_size: 16,
    bytes_data: 32,
};

// 3.6 only differs from 3.4 in fields past the ones we read (co_extra at
// the tail of the code object), but it is a distinct ABI for detection
// purposes.
pub static V36_OFFSETS: StructOffsets = StructOffsets {
    ts_next: 8,
    ts_interp: 16,
    ts_frame: 24,
    ts_thread_id: 152,
    is_tstate_head: 8,
    frame_back: 24,
    frame_code: 32,
    frame_trace: 80,
    frame_lasti: 120,
    frame_lineno: 124,
    code_filename: 96,
    code_name: 104,
    code_firstlineno: 36,
    code_lnotab: 112,
    bytes_size: 16,
    bytes_data: 32,
};

pub static V37_OFFSETS: StructOffsets = StructOffsets {
    ts_next: 8,
    ts_interp: 16,
    ts_frame: 24,
    // 3.7 inserted stackcheck_counter and the exception-state stack ahead
    // of thread_id.
    ts_thread_id: 176,
    is_tstate_head: 8,
    frame_back: 24,
    frame_code: 32,
    frame_trace: 80,
    // f_trace_lines/f_trace_opcodes pushed everything after f_trace down,
    // and the exception triple moved off the frame entirely.
    frame_lasti: 104,
    frame_lineno: 108,
    // Same code-object layout as 3.4/3.6.
    code_filename: 96,
    code_name: 104,
    code_firstlineno: 36,
    code_lnotab: 112,
    bytes_size: 16,
    bytes_data: 32,
};

/// PyASCIIObject.length (3.x compact unicode).
pub const UNICODE_LENGTH: u64 = 16;
/// PyASCIIObject.state, a 32-bit bitfield.
pub const UNICODE_STATE: u64 = 32;
/// sizeof(PyASCIIObject): where character data starts for ASCII strings.
pub const UNICODE_ASCII_DATA: u64 = 48;
/// sizeof(PyCompactUnicodeObject): where data starts for the wider kinds.
pub const UNICODE_COMPACT_DATA: u64 = 72;

/// 3.7 folded the interpreter globals into `_PyRuntime`; these locate the
/// two fields we used to find through their own symbols
/// (3.7.0 headers: `interpreters.head` and `gilstate.tstate_current`).
pub const RUNTIME_INTERP_HEAD: u64 = 24;
pub const RUNTIME_TSTATE_CURRENT: u64 = 1392;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refinement_prefers_later_python3_markers() {
        let abi = PyAbi::Unknown.refine(PyAbi::V34);
        assert_eq!(abi, PyAbi::V34);
        let abi = abi.refine(PyAbi::V36);
        assert_eq!(abi, PyAbi::V36);
        let abi = abi.refine(PyAbi::V37);
        assert_eq!(abi, PyAbi::V37);
        // A less specific marker seen later does not downgrade.
        assert_eq!(abi.refine(PyAbi::V34), PyAbi::V37);
    }

    #[test]
    fn python2_is_sticky() {
        let abi = PyAbi::Unknown.refine(PyAbi::V26);
        assert_eq!(abi.refine(PyAbi::V36), PyAbi::V26);
        assert_eq!(PyAbi::V36.refine(PyAbi::V26), PyAbi::V36);
    }
}
