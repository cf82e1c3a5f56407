//! OS process lookups and termination backed by `sysinfo`.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

fn snapshot() -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys
}

/// Whether `pid` exists and has not exited
pub fn is_running(pid: u32) -> bool {
    snapshot()
        .process(Pid::from_u32(pid))
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Force-kill every process whose name is exactly `name`, except this one.
///
/// Returns how many processes were signalled. Finding none is not an error.
pub fn kill_by_name(name: &str) -> usize {
    let sys = snapshot();
    let own = Pid::from_u32(std::process::id());
    let mut killed = 0;

    for process in sys.processes_by_exact_name(OsStr::new(name)) {
        if process.pid() == own {
            continue;
        }
        if process.kill() {
            killed += 1;
            info!(pid = process.pid().as_u32(), name, "Killed running instance");
        } else {
            warn!(pid = process.pid().as_u32(), name, "Failed to kill running instance");
        }
    }

    if killed == 0 {
        debug!(name, "No running instance found");
    }
    killed
}

/// All live descendants of `pid`, children before grandchildren
pub fn descendants(pid: u32) -> Vec<u32> {
    let sys = snapshot();
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (child, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*child);
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut frontier = vec![Pid::from_u32(pid)];
    while let Some(current) = frontier.pop() {
        for child in children.get(&current).into_iter().flatten() {
            if seen.insert(*child) {
                out.push(child.as_u32());
                frontier.push(*child);
            }
        }
    }
    out
}

/// Ask `pid` (and, on Windows, its tree) to exit
pub fn request_stop(pid: u32) -> bool {
    #[cfg(windows)]
    {
        taskkill(pid, false)
    }

    #[cfg(not(windows))]
    {
        snapshot()
            .process(Pid::from_u32(pid))
            .and_then(|p| p.kill_with(Signal::Term))
            .unwrap_or(false)
    }
}

/// Force-kill `pid` together with every process it spawned.
///
/// Returns the number of processes killed.
pub fn terminate_tree(pid: u32) -> usize {
    #[cfg(windows)]
    {
        usize::from(taskkill(pid, true))
    }

    #[cfg(not(windows))]
    {
        let mut targets = descendants(pid);
        targets.reverse();
        targets.push(pid);
        kill_all(&targets)
    }
}

/// Force-kill each listed pid that is still alive
pub fn kill_all(pids: &[u32]) -> usize {
    let sys = snapshot();
    pids.iter()
        .filter_map(|pid| sys.process(Pid::from_u32(*pid)))
        .filter(|p| p.kill_with(Signal::Kill).unwrap_or_else(|| p.kill()))
        .inspect(|p| debug!(pid = p.pid().as_u32(), "Killed process"))
        .count()
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> bool {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    match std::process::Command::new("taskkill").args(&args).output() {
        Ok(output) => output.status.success(),
        Err(e) => {
            warn!(pid, error = %e, "taskkill failed to run");
            false
        }
    }
}
