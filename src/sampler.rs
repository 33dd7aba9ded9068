use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::abi::PyAbi;
use crate::discovery::{self, InterpreterAddresses};
use crate::error::{ProfileError, Result};
use crate::mntns::MountNamespace;
use crate::profile::{Frame, ProfileData, StackTrace};
use crate::tracee::Tracee;
use crate::walker::{self, Thread};

/// Symbols should already be loaded when attaching to a live process.
pub const MAX_ATTACH_RETRIES: usize = 1;
/// A freshly exec'ed child needs time for the dynamic loader to finish.
pub const MAX_TRACE_RETRIES: usize = 50;

pub struct SamplerConfig {
    /// Time between samples.
    pub interval: Duration,
    /// How long to profile; None means until the target exits or a stop
    /// signal arrives.
    pub duration: Option<Duration>,
    /// Count samples where no thread holds the GIL as `(idle)`.
    pub include_idle: bool,
    /// Keep per-sample timestamps (flame-chart mode). Idle and failed
    /// samples get timestamped records too.
    pub timestamps: bool,
    /// Walk the whole thread list instead of just the GIL holder.
    pub enable_threads: bool,
    /// ABI override; Unknown means auto-detect.
    pub forced_abi: PyAbi,
    /// Symbol-resolution attempts before giving up.
    pub max_retries: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval: Duration::from_millis(10),
            duration: Some(Duration::from_secs(1)),
            include_idle: true,
            timestamps: false,
            enable_threads: false,
            forced_abi: PyAbi::Unknown,
            max_retries: MAX_ATTACH_RETRIES,
        }
    }
}

/// The top of the stack: owns the traced process, the resolved addresses
/// and the sampling loop. Construction leaves the target stopped; the loop
/// alternates it between running and stopped at the configured interval.
pub struct Sampler {
    tracee: Tracee,
    addrs: InterpreterAddresses,
    abi: PyAbi,
    config: SamplerConfig,
    stop: Receiver<()>,
}

impl Sampler {
    /// Attach to a running process.
    pub fn attach(pid: Pid, config: SamplerConfig, stop: Receiver<()>) -> Result<Self> {
        Self::init(Tracee::seize(pid)?, config, stop)
    }

    /// Spawn `argv` under trace and profile it from the start.
    pub fn trace(argv: &[String], config: SamplerConfig, stop: Receiver<()>) -> Result<Self> {
        Self::init(Tracee::spawn(argv)?, config, stop)
    }

    fn init(tracee: Tracee, config: SamplerConfig, stop: Receiver<()>) -> Result<Self> {
        tracee.interrupt()?;
        let ns = MountNamespace::for_pid(tracee.pid());

        let mut attempt = 0;
        let (addrs, abi) = loop {
            match discovery::resolve(tracee.pid(), &ns, config.forced_abi) {
                Ok(found) => break found,
                Err(ProfileError::SymbolsNotLoaded) => {
                    attempt += 1;
                    if attempt >= config.max_retries {
                        return Err(ProfileError::Fatal(
                            "failed to locate interpreter symbols within the retry budget"
                                .to_string(),
                        ));
                    }
                    debug!("interpreter symbols not visible yet (attempt {attempt}), retrying");
                    tracee.resume()?;
                    std::thread::sleep(config.interval);
                    tracee.interrupt()?;
                }
                Err(e) => return Err(e),
            }
        };
        debug!(pid = tracee.pid().as_raw(), ?abi, "target resolved");

        let mut sampler = Sampler {
            tracee,
            addrs,
            abi,
            config,
            stop,
        };
        sampler.fetch_interp_head_hint();
        Ok(sampler)
    }

    /// If thread enumeration was requested but neither the static list
    /// head nor a hint is available, obtain one by calling the public
    /// accessor inside the target.
    #[cfg(target_arch = "x86_64")]
    fn fetch_interp_head_hint(&mut self) {
        if !self.config.enable_threads
            || self.addrs.interp_head_addr != 0
            || self.addrs.interp_head_hint != 0
            || self.addrs.interp_head_fn_addr == 0
        {
            return;
        }
        match self.tracee.call_function(self.addrs.interp_head_fn_addr) {
            Ok(head) => self.addrs.interp_head_hint = head,
            Err(e) => warn!("failed to call the interpreter-state accessor: {e}"),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn fetch_interp_head_hint(&mut self) {}

    pub fn pid(&self) -> Pid {
        self.tracee.pid()
    }

    pub fn abi(&self) -> PyAbi {
        self.abi
    }

    /// The sampling loop. Runs until the configured duration elapses, the
    /// stop channel fires, or the target exits; whatever was collected by
    /// then is returned either way.
    pub fn run(&mut self) -> ProfileData {
        let mut data = ProfileData::default();
        let deadline = self.config.duration.map(|d| Instant::now() + d);

        loop {
            let now_us = epoch_micros();
            match walker::walk_threads(
                &mut self.tracee,
                self.abi,
                &self.addrs,
                self.config.enable_threads,
            ) {
                Ok(threads) => {
                    if threads.is_empty() && self.config.include_idle {
                        data.idle_count += 1;
                        // Most targets idle a lot; only materialize a
                        // record when the caller wants timestamps.
                        if self.config.timestamps {
                            data.stacks.push(StackTrace {
                                captured_at_us: now_us,
                                frames: Vec::new(),
                            });
                        }
                    }
                    for thread in threads {
                        data.stacks.push(StackTrace {
                            captured_at_us: now_us,
                            frames: thread.frames,
                        });
                    }
                }
                Err(ProfileError::TargetTerminated) => {
                    debug!("target exited mid-profile, emitting what we have");
                    return data;
                }
                Err(e) => {
                    data.failed_count += 1;
                    warn!("sample failed: {e}");
                    if self.config.timestamps {
                        data.stacks.push(StackTrace {
                            captured_at_us: now_us,
                            frames: vec![Frame::failed(e.to_string())],
                        });
                    }
                }
            }

            if self.stop.try_recv().is_ok() {
                debug!("stop requested, ending the session");
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() + self.config.interval >= deadline {
                    break;
                }
            }
            match self.step_interval() {
                Ok(()) => {}
                Err(ProfileError::TargetTerminated) => {
                    debug!("target exited between samples");
                    return data;
                }
                Err(e) => {
                    data.failed_count += 1;
                    warn!("failed to pause the target: {e}");
                }
            }
        }
        data
    }

    /// Let the target run for one interval, then stop it again.
    fn step_interval(&self) -> Result<()> {
        self.tracee.resume()?;
        std::thread::sleep(self.config.interval);
        self.tracee.interrupt()
    }

    /// One-shot snapshot of every thread's stack, for dump mode.
    pub fn dump(&mut self) -> Result<Vec<Thread>> {
        walker::walk_threads(&mut self.tracee, self.abi, &self.addrs, true)
    }

    /// Unmap the scratch page (if any) and detach. Errors during cleanup
    /// are logged and swallowed.
    pub fn shutdown(mut self) {
        self.tracee.teardown();
    }
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_cli_defaults() {
        let config = SamplerConfig::default();
        assert_eq!(config.interval, Duration::from_millis(10));
        assert_eq!(config.duration, Some(Duration::from_secs(1)));
        assert!(config.include_idle);
        assert!(!config.enable_threads);
        assert_eq!(config.max_retries, MAX_ATTACH_RETRIES);
    }

    #[test]
    fn epoch_micros_is_monotonic_enough() {
        let a = epoch_micros();
        let b = epoch_micros();
        assert!(b >= a);
    }
}
