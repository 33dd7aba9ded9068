use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use pyflare::abi::PyAbi;

use crate::validators::parse_abi;
use crate::validators::parse_seconds;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

#[derive(Parser, Debug)]
#[command(version, about = "Sampling profiler for running Python processes")]
pub(crate) struct CliArgs {
    /// The PID to profile
    #[arg(short, long, conflicts_with = "trace")]
    pub(crate) pid: Option<i32>,
    /// Trace a freshly spawned command instead of attaching to a PID
    #[arg(
        short = 't',
        long = "trace",
        num_args = 1..,
        value_name = "COMMAND",
        allow_hyphen_values = true,
        conflicts_with = "dump"
    )]
    pub(crate) trace: Vec<String>,
    /// Sample rate, as a fractional value of seconds
    #[arg(short, long, default_value = "0.01", value_parser = parse_seconds)]
    pub(crate) rate: Duration,
    /// How many seconds to run for (default 1; in trace mode the default
    /// is to follow the child until it exits)
    #[arg(short, long, value_parser = parse_seconds)]
    pub(crate) seconds: Option<Duration>,
    /// Exclude idle time from statistics
    #[arg(short = 'x', long)]
    pub(crate) exclude_idle: bool,
    /// Output to file path (default stdout)
    #[arg(short, long)]
    pub(crate) output: Option<PathBuf>,
    /// Sample every interpreter thread, not just the one holding the GIL
    #[arg(long)]
    pub(crate) threads: bool,
    /// Include timestamps for generating Chrome "flamecharts"
    #[arg(long)]
    pub(crate) flamechart: bool,
    /// Do not append line numbers to function names
    #[arg(short = 'n', long)]
    pub(crate) no_line_numbers: bool,
    /// Dump stacks from all threads and exit (implies --threads)
    #[arg(short = 'd', long)]
    pub(crate) dump: bool,
    /// Force a particular Python ABI (26, 34, 36, 37)
    #[arg(long, value_parser = parse_abi)]
    pub(crate) abi: Option<PyAbi>,
    /// Set pyflare's logging level
    #[arg(long, default_value_t, value_enum)]
    pub(crate) logging: LoggingLevel,
}
