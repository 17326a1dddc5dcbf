//! Facts about the machine the engine runs on.

use std::path::Path;

pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
    #[cfg(not(unix))]
    {
        "localhost".to_string()
    }
}

pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with `pid` still exists on this host.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Sends SIGTERM to the process group led by `pid`, so helpers a
/// shell-wrapped stage started die with it. Falls back to the pid alone when
/// it does not lead a group. Returns false when nothing was signalled.
pub fn terminate_group(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        killpg(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
            || kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub fn cpu_count() -> u32 {
    u32::try_from(num_cpus::get().max(1)).unwrap_or(u32::MAX)
}

/// One-minute load average, when the platform exposes it.
pub async fn load_average() -> Option<f64> {
    let raw = tokio::fs::read_to_string("/proc/loadavg").await.ok()?;
    parse_loadavg(&raw)
}

/// Total physical memory in whole gigabytes.
pub fn total_mem_gb() -> Option<u32> {
    let raw = std::fs::read_to_string(Path::new("/proc/meminfo")).ok()?;
    parse_meminfo_total_gb(&raw)
}

fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo_total_gb(raw: &str) -> Option<u32> {
    let line = raw.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    u32::try_from(kb / (1024 * 1024)).ok()
}
