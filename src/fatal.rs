//! Handling of unrecoverable CDM hardware errors.
//!
//! A `HwError` key status leaves the secure pipeline in an unknown state, so
//! the default policy stops the vendor CDM helper processes and then kills
//! the host process. The policy is a trait so hosts and tests can replace it.
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::config::FatalConfig;

/// Reaction to a `HwError` key status.
pub trait FatalErrorPolicy: Send + Sync {
    /// Called once the session moved to `KEY_ERROR`. The default policy
    /// does not return.
    fn on_hardware_error(&self, key_system: &str);
}

/// Process lookup and signalling.
pub trait ProcessTable: Send + Sync {
    /// PIDs whose command name equals `name`.
    fn pids_by_name(&self, name: &str) -> Vec<i32>;

    /// Send SIGKILL to `pid`.
    fn kill(&self, pid: i32) -> std::io::Result<()>;

    /// Kill the current process.
    fn terminate_self(&self);
}

/// [`ProcessTable`] backed by `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsTable;

impl ProcessTable for ProcfsTable {
    fn pids_by_name(&self, name: &str) -> Vec<i32> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| {
                let comm = Path::new("/proc").join(pid.to_string()).join("comm");
                fs::read_to_string(comm)
                    .map(|comm| comm.trim_end() == name)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn kill(&self, pid: i32) -> std::io::Result<()> {
        signal::kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(std::io::Error::from)
    }

    fn terminate_self(&self) {
        let _ = signal::raise(Signal::SIGKILL);
        // SIGKILL cannot be caught; only reached if raise itself failed.
        std::process::abort();
    }
}

/// Default policy: stop the vendor helpers, let logs flush, then die.
pub struct TerminateProcess {
    table: Box<dyn ProcessTable>,
    helper_processes: Vec<String>,
    flush_delay: Duration,
}

impl TerminateProcess {
    pub fn new(
        table: Box<dyn ProcessTable>,
        helper_processes: Vec<String>,
        flush_delay: Duration,
    ) -> Self {
        Self {
            table,
            helper_processes,
            flush_delay,
        }
    }

    pub fn from_config(config: &FatalConfig) -> Self {
        Self::new(
            Box::new(ProcfsTable),
            config.helper_processes.clone(),
            Duration::from_millis(config.flush_delay_ms),
        )
    }
}

impl FatalErrorPolicy for TerminateProcess {
    fn on_hardware_error(&self, key_system: &str) {
        error!(
            "Unrecoverable CDM hardware error for {}, terminating process",
            key_system
        );

        for name in &self.helper_processes {
            for pid in self.table.pids_by_name(name) {
                match self.table.kill(pid) {
                    Ok(()) => warn!("Killed CDM helper {} (pid {})", name, pid),
                    Err(e) => error!("Failed to kill CDM helper {} (pid {}): {}", name, pid, e),
                }
            }
        }

        thread::sleep(self.flush_delay);
        self.table.terminate_self();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Recorded {
        killed: Vec<i32>,
        terminated: bool,
    }

    struct FakeTable(Arc<Mutex<Recorded>>);

    impl ProcessTable for FakeTable {
        fn pids_by_name(&self, name: &str) -> Vec<i32> {
            match name {
                "WPEcdmi" => vec![101, 102],
                _ => Vec::new(),
            }
        }

        fn kill(&self, pid: i32) -> std::io::Result<()> {
            self.0.lock().unwrap().killed.push(pid);
            Ok(())
        }

        fn terminate_self(&self) {
            self.0.lock().unwrap().terminated = true;
        }
    }

    #[test]
    fn kills_helpers_then_terminates() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let policy = TerminateProcess::new(
            Box::new(FakeTable(recorded.clone())),
            vec!["WPEcdmi".to_string(), "absent".to_string()],
            Duration::ZERO,
        );

        policy.on_hardware_error("com.widevine.alpha");

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.killed, vec![101, 102]);
        assert!(recorded.terminated);
    }

    #[test]
    fn procfs_finds_nothing_for_unknown_name() {
        assert!(ProcfsTable
            .pids_by_name("rsdrm-no-such-process-name")
            .is_empty());
    }
}
