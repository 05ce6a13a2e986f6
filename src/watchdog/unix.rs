//! Signal-based liveness probing.

use nix::sys::signal::kill;
use nix::unistd::{getppid, Pid};

use super::LivenessProbe;

/// Sends the null signal to a captured pid.
///
/// The parent flavour also requires `getppid()` to still return the captured
/// pid. Once the parent exits the subordinate is reparented, so a recycled pid
/// belonging to an unrelated process is never mistaken for the parent.
#[derive(Debug, Clone)]
pub struct SignalProbe {
    pid: u32,
    is_parent: bool,
}

impl SignalProbe {
    /// Capture the current parent.
    pub fn parent() -> Self {
        Self {
            pid: getppid().as_raw() as u32,
            is_parent: true,
        }
    }

    /// Watch an arbitrary process.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            is_parent: false,
        }
    }
}

impl LivenessProbe for SignalProbe {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        // 0 and negative values address process groups, not a process.
        let Some(pid) = i32::try_from(self.pid)
            .ok()
            .filter(|raw| *raw > 0)
            .map(Pid::from_raw)
        else {
            return false;
        };
        if self.is_parent && getppid() != pid {
            return false;
        }
        kill(pid, None).is_ok()
    }
}
