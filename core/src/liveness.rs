//! OS-level process liveness checks.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// What the OS reports about a process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// The process exists.
    Alive,
    /// No such process.
    Dead,
    /// The OS refused to say, e.g. permission denied.
    Unknown,
}

/// Capability for asking whether a process id is alive.
pub trait ProcessProbe: Send + Sync {
    /// Returns the liveness of `pid`.
    fn liveness(&self, pid: u32) -> Liveness;
}

/// Probe that sends the null signal to the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn liveness(&self, pid: u32) -> Liveness {
        let Ok(raw) = i32::try_from(pid) else {
            return Liveness::Unknown;
        };
        if raw <= 0 {
            return Liveness::Unknown;
        }

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => Liveness::Alive,
            Err(Errno::ESRCH) => Liveness::Dead,
            Err(e) => {
                tracing::debug!(pid, error = %e, "process liveness could not be determined");
                Liveness::Unknown
            }
        }
    }
}
