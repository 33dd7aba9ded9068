use tracing::debug;

use crate::abi::PyAbi;
use crate::discovery::InterpreterAddresses;
use crate::error::Result;
use crate::linetab;
use crate::mem::Mem;
use crate::profile::Frame;
use crate::pystr;
use crate::tracee::Target;

/// Cap on the frame chain so a torn `f_back` pointer cannot send us on an
/// unbounded (or cyclic) walk.
pub const MAX_FRAME_DEPTH: usize = 4096;

/// One interpreter thread observed at a single sample instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: u64,
    /// Whether this thread state is the one the current-thread pointer
    /// designates (the thread holding the GIL).
    pub is_active: bool,
    /// Most-recent-first.
    pub frames: Vec<Frame>,
}

impl std::fmt::Display for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Thread {} {}",
            self.id,
            if self.is_active { "(active)" } else { "(idle)" }
        )?;
        for frame in &self.frames {
            writeln!(f, "    {frame}")?;
        }
        Ok(())
    }
}

/// Snapshot every interpreter thread of the stopped target.
///
/// With `enable_threads` unset, only the thread designated by the
/// current-thread pointer is walked; otherwise the interpreter state is
/// located and its whole thread list traversed. An empty result means the
/// interpreter is idle (nothing holds the GIL).
pub fn walk_threads<T: Target>(
    target: &mut T,
    abi: PyAbi,
    addrs: &InterpreterAddresses,
    enable_threads: bool,
) -> Result<Vec<Thread>> {
    let offsets = abi.offsets();

    let mut tstate = if addrs.tstate_addr != 0 {
        target.peek_word(addrs.tstate_addr)?
    } else {
        0
    };
    if tstate == 0 && addrs.tstate_get_fn_addr != 0 {
        // The pointer is only set while some thread holds the GIL; the
        // accessor works regardless.
        tstate = match target.call_in_target(addrs.tstate_get_fn_addr) {
            Ok(value) => value,
            Err(e) => {
                debug!("thread-state accessor call failed: {e}");
                0
            }
        };
    }

    if !enable_threads {
        if tstate == 0 {
            return Ok(Vec::new());
        }
        let frame = target.peek_word(tstate + offsets.ts_frame)?;
        if frame == 0 {
            return Ok(Vec::new());
        }
        let id = target.peek_word(tstate + offsets.ts_thread_id)?;
        return Ok(vec![Thread {
            id,
            is_active: true,
            frames: walk_frames(target, abi, frame)?,
        }]);
    }

    // Find the interpreter state: through the current thread if there is
    // one, else through the static list head, else through a hint obtained
    // by calling the accessor inside the target.
    let istate = if tstate != 0 {
        target.peek_word(tstate + offsets.ts_interp)?
    } else if addrs.interp_head_addr != 0 {
        target.peek_word(addrs.interp_head_addr)?
    } else {
        addrs.interp_head_hint
    };
    if istate == 0 {
        return Ok(Vec::new());
    }

    let mut threads = Vec::new();
    let mut link = istate + offsets.is_tstate_head;
    loop {
        let chain = target.peek_word(link)?;
        if chain == 0 {
            break;
        }
        let id = target.peek_word(chain + offsets.ts_thread_id)?;
        let frame = target.peek_word(chain + offsets.ts_frame)?;
        if frame != 0 {
            threads.push(Thread {
                id,
                is_active: chain == tstate,
                frames: walk_frames(target, abi, frame)?,
            });
        }
        link = chain + offsets.ts_next;
    }
    Ok(threads)
}

/// Chase the `f_back` chain from the innermost frame, most recent first.
fn walk_frames<T: Target>(target: &mut T, abi: PyAbi, first_frame: u64) -> Result<Vec<Frame>> {
    let offsets = abi.offsets();
    let mut frames = Vec::new();
    let mut frame = first_frame;
    while frame != 0 && frames.len() < MAX_FRAME_DEPTH {
        let code = target.peek_word(frame + offsets.frame_code)?;
        let filename_obj = target.peek_word(code + offsets.code_filename)?;
        let file = pystr::read_string(target, abi, filename_obj)?;
        let name_obj = target.peek_word(code + offsets.code_name)?;
        let function = pystr::read_string(target, abi, name_obj)?;
        let line = line_number(target, abi, frame, code)?;
        frames.push(Frame {
            file,
            function,
            line,
        });
        frame = target.peek_word(frame + offsets.frame_back)?;
    }
    Ok(frames)
}

/// What `PyFrame_GetLineNumber` does, over peeked memory: a frame being
/// traced has an authoritative `f_lineno`, everything else goes through the
/// compressed line table.
fn line_number<M: Mem>(mem: &M, abi: PyAbi, frame: u64, code: u64) -> Result<u64> {
    let offsets = abi.offsets();
    const INT_MAX: u64 = i32::MAX as u64;

    let f_trace = mem.peek_word(frame + offsets.frame_trace)?;
    if f_trace != 0 {
        return Ok(mem.peek_word(frame + offsets.frame_lineno)? & INT_MAX);
    }

    let f_lasti = mem.peek_word(frame + offsets.frame_lasti)? & INT_MAX;
    let lnotab_obj = mem.peek_word(code + offsets.code_lnotab)?;
    let first_line = mem.peek_word(code + offsets.code_firstlineno)? & INT_MAX;
    let table = pystr::read_bytes_object(mem, abi, lnotab_obj)?;
    Ok(linetab::line_for_offset(&table, first_line, f_lasti))
}
