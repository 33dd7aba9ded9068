//! The interpreter stores the bytecode-offset → source-line mapping as a
//! compressed table of `(byte_increment, line_increment)` pairs hanging
//! off the code object (`co_lnotab`). This is the same walk
//! `PyCode_Addr2Line` performs, done over bytes we peeked out of the
//! target.

/// Recover the source line for the instruction at `last_instruction`.
///
/// Accumulates byte increments until the running bytecode address would
/// pass `last_instruction`; the line accumulated up to that point is the
/// answer.
pub fn line_for_offset(table: &[u8], first_line: u64, last_instruction: u64) -> u64 {
    let mut line = first_line;
    let mut addr = 0u64;
    for pair in table.chunks_exact(2) {
        addr += u64::from(pair[0]);
        if addr > last_instruction {
            break;
        }
        line += u64::from(pair[1]);
    }
    line
}
