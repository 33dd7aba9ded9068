use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};

use crate::aggregator;
use crate::walker::Thread;

/// One interpreter call-stack entry.
///
/// Equality and hashing deliberately ignore the function name: two frames
/// with the same file and line are the same bucket key, and the name is
/// carried along for display only. Downstream aggregation depends on this.
#[derive(Debug, Clone, Eq)]
pub struct Frame {
    pub file: String,
    pub function: String,
    pub line: u64,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.file == other.file && self.line == other.line
    }
}

impl Hash for Frame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file.hash(state);
        self.line.hash(state);
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.function, self.line)
    }
}

impl Frame {
    /// Marker frame recorded for a failed sample in flame-chart mode.
    pub(crate) fn failed(detail: String) -> Self {
        Frame {
            file: FAILED.to_string(),
            function: detail,
            line: 0,
        }
    }

    pub(crate) fn is_failure_marker(&self) -> bool {
        self.file == FAILED
    }

    fn write_to(&self, out: &mut impl Write, include_line: bool) -> io::Result<()> {
        if include_line {
            write!(out, "{}:{}:{}", self.file, self.function, self.line)
        } else {
            write!(out, "{}:{}", self.file, self.function)
        }
    }
}

const IDLE: &str = "(idle)";
const FAILED: &str = "(failed)";

/// The stack of one thread at one sample instant, stamped with
/// microseconds since the epoch. An empty frame list records an idle
/// sample (only kept in flame-chart mode).
#[derive(Debug, Clone, PartialEq)]
pub struct StackTrace {
    pub captured_at_us: u64,
    /// Most-recent-first.
    pub frames: Vec<Frame>,
}

/// Everything one sampling session produced.
#[derive(Debug, Default)]
pub struct ProfileData {
    pub stacks: Vec<StackTrace>,
    pub idle_count: u64,
    pub failed_count: u64,
}

impl ProfileData {
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty() && self.idle_count == 0 && self.failed_count == 0
    }
}

/// Write the folded-stack histogram: one `root;child;leaf N` line per
/// distinct stack, preceded by `(idle)`/`(failed)` totals when non-zero.
pub fn write_folded(
    out: &mut impl Write,
    data: &ProfileData,
    include_line: bool,
) -> io::Result<()> {
    if data.idle_count > 0 {
        writeln!(out, "{IDLE} {}", data.idle_count)?;
    }
    if data.failed_count > 0 {
        writeln!(out, "{FAILED} {}", data.failed_count)?;
    }
    let buckets = aggregator::aggregate(data.stacks.iter().map(|s| s.frames.as_slice()));
    for (frames, count) in buckets {
        // Stacks are stored most-recent-first; folded output wants the
        // root first.
        let mut first = true;
        for frame in frames.iter().rev() {
            if !first {
                write!(out, ";")?;
            }
            frame.write_to(out, include_line)?;
            first = false;
        }
        writeln!(out, " {count}")?;
    }
    Ok(())
}

/// Write the timestamped sequence used for flame charts: microseconds on
/// one line, then the stack (or an `(idle)`/`(failed)` marker).
pub fn write_flamechart(
    out: &mut impl Write,
    data: &ProfileData,
    include_line: bool,
) -> io::Result<()> {
    for stack in &data.stacks {
        writeln!(out, "{}", stack.captured_at_us)?;
        if stack.frames.is_empty() {
            writeln!(out, "{IDLE}")?;
            continue;
        }
        if stack.frames.len() == 1 && stack.frames[0].is_failure_marker() {
            writeln!(out, "{FAILED}")?;
            continue;
        }
        for frame in stack.frames.iter().rev() {
            frame.write_to(out, include_line)?;
            write!(out, ";")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Human-readable dump of a one-shot thread snapshot.
pub fn write_thread_dump(out: &mut impl Write, threads: &[Thread]) -> io::Result<()> {
    for (i, thread) in threads.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        write!(out, "{thread}")?;
    }
    Ok(())
}
