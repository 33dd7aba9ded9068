use std::fs::File;
use std::io::IsTerminal;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use crossbeam_channel::bounded;
use nix::unistd::Pid;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use pyflare::abi::PyAbi;
use pyflare::profile;
use pyflare::sampler::{Sampler, SamplerConfig, MAX_ATTACH_RETRIES, MAX_TRACE_RETRIES};

mod args;
mod validators;

use crate::args::CliArgs;
use crate::args::LoggingLevel;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.logging {
            LoggingLevel::Trace => Level::TRACE,
            LoggingLevel::Debug => Level::DEBUG,
            LoggingLevel::Info => Level::INFO,
            LoggingLevel::Warn => Level::WARN,
            LoggingLevel::Error => Level::ERROR,
        })
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let trace_mode = !args.trace.is_empty();
    if !trace_mode && args.pid.is_none() {
        error!("either --pid or --trace is required");
        return ExitCode::FAILURE;
    }
    if trace_mode && args.trace[0].ends_with("pyflare") {
        error!("you tried to pyflare a pyflare, naughty!");
        return ExitCode::FAILURE;
    }

    let config = SamplerConfig {
        interval: args.rate,
        // Trace mode follows the child until it exits unless -s was
        // given; attach mode defaults to one second.
        duration: if trace_mode {
            args.seconds
        } else {
            Some(args.seconds.unwrap_or(std::time::Duration::from_secs(1)))
        },
        include_idle: !args.exclude_idle,
        timestamps: args.flamechart,
        enable_threads: args.threads || args.dump,
        forced_abi: args.abi.unwrap_or(PyAbi::Unknown),
        max_retries: if trace_mode {
            MAX_TRACE_RETRIES
        } else {
            MAX_ATTACH_RETRIES
        },
    };

    let (stop_sender, stop_receiver) = bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received Ctrl+C, stopping...");
        let _ = stop_sender.send(());
    }) {
        debug!("could not install Ctrl+C handler: {e}");
    }

    let sampler = if trace_mode {
        Sampler::trace(&args.trace, config, stop_receiver)
    } else {
        Sampler::attach(Pid::from_raw(args.pid.unwrap()), config, stop_receiver)
    };
    let mut sampler = match sampler {
        Ok(sampler) => sampler,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let result = if args.dump {
        dump_threads(&mut sampler, &args.output)
    } else {
        let data = sampler.run();
        write_profile(&data, &args)
    };

    sampler.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn open_output(path: &Option<PathBuf>) -> anyhow::Result<Box<dyn Write>> {
    match path {
        None => Ok(Box::new(std::io::stdout().lock())),
        Some(path) => {
            let file = File::create(path)
                .map_err(|e| anyhow::anyhow!("cannot open {} as output: {e}", path.display()))?;
            Ok(Box::new(file))
        }
    }
}

fn dump_threads(sampler: &mut Sampler, output: &Option<PathBuf>) -> anyhow::Result<()> {
    let threads = sampler.dump()?;
    let mut out = open_output(output)?;
    profile::write_thread_dump(&mut out, &threads)?;
    Ok(())
}

fn write_profile(data: &pyflare::profile::ProfileData, args: &CliArgs) -> anyhow::Result<()> {
    if data.is_empty() {
        anyhow::bail!("no samples collected before the target went away");
    }
    let mut out = open_output(&args.output)?;
    if args.flamechart {
        profile::write_flamechart(&mut out, data, !args.no_line_numbers)?;
    } else {
        profile::write_folded(&mut out, data, !args.no_line_numbers)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert()
    }

    #[test]
    fn pid_and_trace_are_mutually_exclusive() {
        assert!(CliArgs::try_parse_from(["pyflare", "-p", "123", "-t", "python"]).is_err());
    }

    #[test]
    fn trace_collects_the_whole_command() {
        let args =
            CliArgs::try_parse_from(["pyflare", "-t", "python", "busy.py", "--fast"]).unwrap();
        assert_eq!(args.trace, vec!["python", "busy.py", "--fast"]);
    }

    #[test]
    fn rate_and_seconds_parse_as_fractions() {
        let args = CliArgs::try_parse_from(["pyflare", "-p", "1", "-r", "0.001", "-s", "2.5"])
            .unwrap();
        assert_eq!(args.rate, std::time::Duration::from_millis(1));
        assert_eq!(args.seconds, Some(std::time::Duration::from_millis(2500)));
    }
}
