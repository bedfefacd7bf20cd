//! Resource limits and the watchdog around a running child.

use crate::config::ResourceLimits;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How often the resident-set size of the child is sampled
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The limit that caused a forced termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Memory { ceiling_bytes: Option<u64> },
    CpuTime { seconds: Option<u64> },
    FileSize { max_bytes: Option<u64> },
}

/// Terminal state of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The process exited on its own
    Completed { exit_code: i32 },
    /// The wall-clock deadline passed and the process group was killed
    TimedOut { after: Duration },
    /// A resource ceiling was hit
    ResourceExceeded(LimitKind),
    /// The process died from a signal or could not be waited on
    Crashed { reason: String },
}

impl GuardOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GuardOutcome::Completed { exit_code: 0 })
    }
}

/// Enforces the limits of a single execution
pub struct ResourceGuard {
    limits: ResourceLimits,
}

impl ResourceGuard {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Put the child in its own process group and apply rlimits before exec
    #[cfg(unix)]
    pub fn apply(&self, cmd: &mut Command) {
        let cpu_seconds = self.limits.cpu_seconds;
        let max_file_bytes = self.limits.max_file_bytes;
        let max_processes = self.limits.max_processes;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = self.limits.memory_ceiling_bytes;

        unsafe {
            cmd.pre_exec(move || {
                // New process group so the whole tree can be killed at once
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                // macOS doesn't support RLIMIT_AS properly, skip it
                #[cfg(not(target_os = "macos"))]
                {
                    if let Some(bytes) = memory_bytes {
                        set_limit(libc::RLIMIT_AS, bytes)?;
                    }
                }
                if let Some(seconds) = cpu_seconds {
                    set_limit(libc::RLIMIT_CPU, seconds)?;
                }
                if let Some(bytes) = max_file_bytes {
                    set_limit(libc::RLIMIT_FSIZE, bytes)?;
                }
                // RLIMIT_NPROC is also problematic on macOS
                #[cfg(not(target_os = "macos"))]
                {
                    if let Some(count) = max_processes {
                        set_limit(libc::RLIMIT_NPROC, count)?;
                    }
                }
                #[cfg(target_os = "macos")]
                let _ = max_processes;

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn apply(&self, _cmd: &mut Command) {
        // No rlimits here; the deadline still applies
    }

    /// Wait for `child` to reach a terminal state.
    ///
    /// Races the child's exit against the deadline and the memory poll. On
    /// anything but a normal exit the process group is killed before returning.
    pub async fn watch(&self, child: &mut Child) -> GuardOutcome {
        let timeout = self.limits.timeout();
        let pid = child.id();

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => return self.classify_status(status),
                Err(e) => GuardOutcome::Crashed {
                    reason: format!("failed to wait for process: {e}"),
                },
            },
            _ = tokio::time::sleep(timeout) => GuardOutcome::TimedOut { after: timeout },
            _ = memory_watch(pid, self.limits.memory_ceiling_bytes) => {
                GuardOutcome::ResourceExceeded(LimitKind::Memory {
                    ceiling_bytes: self.limits.memory_ceiling_bytes,
                })
            }
        };

        warn!("[SANDBOX] Terminating execution: {:?}", outcome);
        terminate(child).await;
        outcome
    }

    fn classify_status(&self, status: std::process::ExitStatus) -> GuardOutcome {
        if let Some(code) = status.code() {
            return GuardOutcome::Completed { exit_code: code };
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return match signal {
                    libc::SIGXCPU => GuardOutcome::ResourceExceeded(LimitKind::CpuTime {
                        seconds: self.limits.cpu_seconds,
                    }),
                    libc::SIGXFSZ => GuardOutcome::ResourceExceeded(LimitKind::FileSize {
                        max_bytes: self.limits.max_file_bytes,
                    }),
                    _ => GuardOutcome::Crashed {
                        reason: format!("killed by signal {signal}"),
                    },
                };
            }
        }

        GuardOutcome::Crashed {
            reason: format!("terminated abnormally ({status})"),
        }
    }
}

/// Kill the child's whole process group and reap the child.
///
/// Also used after a normal exit to clean up anything the guest left running.
pub async fn terminate(child: &mut Child) {
    kill_group(child.id());
    if let Err(e) = child.kill().await {
        debug!("[SANDBOX] Child already reaped: {}", e);
    }
}

/// Kill every process in the group led by `pid`
pub fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!("[SANDBOX] Failed to kill process group {}: {}", pid, e),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

#[cfg(unix)]
fn set_limit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &rlimit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Resolves once the child's resident set exceeds `ceiling`. Never resolves
/// when there is no ceiling or memory can't be sampled on this platform.
async fn memory_watch(pid: Option<u32>, ceiling: Option<u64>) {
    let (Some(pid), Some(ceiling)) = (pid, ceiling) else {
        return std::future::pending().await;
    };

    let mut interval = tokio::time::interval(MEMORY_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match resident_memory(pid) {
            Some(rss) if rss > ceiling => {
                warn!(
                    "[SANDBOX] Resident memory {} MB exceeds ceiling {} MB",
                    rss / (1024 * 1024),
                    ceiling / (1024 * 1024)
                );
                return;
            }
            Some(_) => {}
            None if cfg!(target_os = "linux") => {}
            None => return std::future::pending().await,
        }
    }
}

/// Resident-set size of `pid` in bytes, from /proc/<pid>/status
#[cfg(target_os = "linux")]
pub fn resident_memory(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory(_pid: u32) -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb.saturating_mul(1024))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmRSS:\t   1536 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(1536 * 1024));
        assert_eq!(parse_vm_rss("Name:\tzombie\n"), None);
    }

    #[test]
    fn test_only_clean_exit_is_success() {
        assert!(GuardOutcome::Completed { exit_code: 0 }.is_success());
        assert!(!GuardOutcome::Completed { exit_code: 1 }.is_success());
        assert!(!GuardOutcome::TimedOut {
            after: Duration::from_secs(1)
        }
        .is_success());
    }

    #[cfg(unix)]
    fn sh(script: &str, guard: &ResourceGuard) -> Child {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        guard.apply(&mut cmd);
        cmd.spawn().unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let guard = ResourceGuard::new(ResourceLimits::default());
        let mut child = sh("exit 7", &guard);
        assert_eq!(
            guard.watch(&mut child).await,
            GuardOutcome::Completed { exit_code: 7 }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deadline_kills_hung_process() {
        let guard = ResourceGuard::new(ResourceLimits::default().with_timeout_secs(0.3));
        let mut child = sh("while :; do :; done", &guard);

        let started = std::time::Instant::now();
        let outcome = guard.watch(&mut child).await;

        assert!(matches!(outcome, GuardOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        // reaped
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deadline_kills_background_children() {
        let guard = ResourceGuard::new(ResourceLimits::default().with_timeout_secs(0.3));
        let mut child = sh("sleep 30 & sleep 30 & wait", &guard);

        let started = std::time::Instant::now();
        let outcome = guard.watch(&mut child).await;

        assert!(matches!(outcome, GuardOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_death_is_crash() {
        let guard = ResourceGuard::new(ResourceLimits::default());
        let mut child = sh("kill -TERM $$", &guard);
        let outcome = guard.watch(&mut child).await;
        assert!(matches!(outcome, GuardOutcome::Crashed { .. }), "{outcome:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ResourceLimits {
            max_file_bytes: Some(1024),
            ..ResourceLimits::default()
        };
        let guard = ResourceGuard::new(limits);
        let script = format!(
            "trap - XFSZ; head -c 100000 /dev/zero > {}/big.bin",
            dir.path().display()
        );
        let mut child = sh(&script, &guard);
        let outcome = guard.watch(&mut child).await;
        // `head` dies from SIGXFSZ and the shell reports 128+25
        assert!(
            matches!(
                outcome,
                GuardOutcome::Completed { exit_code } if exit_code != 0
            ) || matches!(
                outcome,
                GuardOutcome::ResourceExceeded(LimitKind::FileSize { .. })
            ),
            "{outcome:?}"
        );
    }
}
