//! Parent liveness watchdog.
//!
//! A subordinate process captures its parent once at startup and probes it on
//! a fixed period from a dedicated OS thread. The first failed probe is fatal:
//! the watchdog logs a diagnostic and terminates the whole process with
//! [`WATCHDOG_EXIT_CODE`]. There is no retry.
//!
//! The probing mechanism is chosen at compile time:
//! - unix: signal 0 to the captured pid ([`SignalProbe`])
//! - windows: zero-timeout wait on a handle to the parent ([`HandleProbe`])

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::SignalProbe;
#[cfg(windows)]
pub use windows::HandleProbe;

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::DEFAULT_WATCHDOG_PERIOD_MS;
use crate::error::{PhoenixError, Result};
use crate::log_component;

/// Exit status of a subordinate whose parent went away.
pub const WATCHDOG_EXIT_CODE: i32 = 1;

/// Default time between probes.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(DEFAULT_WATCHDOG_PERIOD_MS);

/// "Can I still observe this process as alive?"
pub trait LivenessProbe: Send {
    /// The process being watched.
    fn pid(&self) -> u32;

    /// `false` once the process is gone or no longer reachable.
    fn is_alive(&self) -> bool;
}

/// Probe for the parent of the current process, using the platform mechanism.
pub fn parent_probe() -> Result<Box<dyn LivenessProbe>> {
    #[cfg(unix)]
    {
        Ok(Box::new(SignalProbe::parent()))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(HandleProbe::parent()?))
    }
    #[cfg(not(any(unix, windows)))]
    {
        Err(PhoenixError::Watchdog(
            "no liveness probe for this platform".into(),
        ))
    }
}

type LossAction = Box<dyn FnOnce(u32) + Send>;

fn terminate(_pid: u32) {
    std::process::exit(WATCHDOG_EXIT_CODE);
}

pub struct Watchdog {
    probe: Box<dyn LivenessProbe>,
    period: Duration,
    on_loss: LossAction,
}

impl Watchdog {
    pub fn new(probe: Box<dyn LivenessProbe>, period: Duration) -> Self {
        let period = if period.is_zero() { DEFAULT_PERIOD } else { period };
        Self {
            probe,
            period,
            on_loss: Box::new(terminate),
        }
    }

    /// Watch the current process's parent.
    pub fn parent(period: Duration) -> Result<Self> {
        Ok(Self::new(parent_probe()?, period))
    }

    /// Replace process termination with `action`, which receives the lost pid.
    pub fn on_loss<F>(mut self, action: F) -> Self
    where
        F: FnOnce(u32) + Send + 'static,
    {
        self.on_loss = Box::new(action);
        self
    }

    pub fn pid(&self) -> u32 {
        self.probe.pid()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Probe until the watched process is lost, then run the loss action.
    ///
    /// With the default action this never returns.
    pub fn run(self) {
        let Watchdog {
            probe,
            period,
            on_loss,
        } = self;
        let pid = probe.pid();

        log_component!(
            debug,
            "watchdog",
            "watching parent",
            pid = pid,
            period_ms = period.as_millis() as u64
        );

        loop {
            if !probe.is_alive() {
                log_component!(
                    error,
                    "watchdog",
                    "parent process unreachable, exiting",
                    pid = pid,
                    exit_code = WATCHDOG_EXIT_CODE
                );
                on_loss(pid);
                return;
            }
            thread::sleep(period);
        }
    }

    /// Run on a dedicated thread so a stalled async runtime cannot delay it.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("parent-watchdog".into())
            .spawn(move || self.run())
            .map_err(|e| PhoenixError::Watchdog(format!("failed to start thread: {}", e)))
    }
}
