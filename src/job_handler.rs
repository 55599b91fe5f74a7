//! Job handler (§4.1): spawns one worker subprocess, supervises it under
//! memory and wall-clock limits, and classifies its termination. Never
//! propagates a worker failure as an error out of the supervision loop —
//! everything comes back through [`WorkerOutcome`].

use crate::config::ResourceLimitsConfig;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub struct WorkerSpawnRequest {
    pub python_executable: PathBuf,
    pub script: PathBuf,
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub log_path: PathBuf,
    pub err_path: PathBuf,
}

#[derive(Debug)]
pub struct WorkerOutcome {
    pub pid: Option<u32>,
    pub success: bool,
    pub information: Option<String>,
    pub error: Option<String>,
}

pub struct ClassificationNote {
    pub information: Option<String>,
    pub error: Option<String>,
}

/// Runs one worker to completion under the configured resource limits.
/// Returns without spawning anything in communication-only mode (§4.1).
pub async fn run(
    request: &WorkerSpawnRequest,
    limits: &ResourceLimitsConfig,
    ignorable: &[Regex],
    communication_only: bool,
) -> WorkerOutcome {
    if communication_only {
        return WorkerOutcome {
            pid: None,
            success: true,
            information: None,
            error: None,
        };
    }

    // Truncate-or-create log/err files before spawn, per §4.1.
    if let Err(e) = std::fs::File::create(&request.log_path) {
        return spawn_failure(format!("could not create log file: {e}"));
    }
    if let Err(e) = std::fs::File::create(&request.err_path) {
        return spawn_failure(format!("could not create error file: {e}"));
    }

    let log_file = match std::fs::OpenOptions::new().append(true).open(&request.log_path) {
        Ok(f) => f,
        Err(e) => return spawn_failure(format!("could not reopen log file: {e}")),
    };
    let err_file = match std::fs::OpenOptions::new().append(true).open(&request.err_path) {
        Ok(f) => f,
        Err(e) => return spawn_failure(format!("could not reopen error file: {e}")),
    };

    let output_dir_arg = format!("{}/", request.output_dir.display());

    let mut command = Command::new(&request.python_executable);
    command
        .arg(&request.script)
        .arg(&request.input_file)
        .arg(&output_dir_arg)
        .current_dir(&request.output_dir)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(err_file));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New process group so the whole worker tree can be signalled at once.
        command.process_group(0);
    }

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => return spawn_failure(crate::error::AgentError::Spawn(e).to_string()),
    };

    let pid = child.id();
    debug!(?pid, script = %request.script.display(), "worker spawned");
    let outcome = supervise(&mut child, pid, request, limits).await;

    match outcome {
        SupervisionResult::Exited => {
            info!(?pid, "worker exited");
            let (success, note) = classify(&request.err_path, ignorable);
            WorkerOutcome {
                pid,
                success,
                information: note.information,
                error: note.error,
            }
        }
        SupervisionResult::Killed { reason } => {
            warn!(?pid, %reason, "worker killed for exceeding resource limit");
            append_diagnostic(&request.err_path, &reason);
            let (success, note) = classify(&request.err_path, ignorable);
            WorkerOutcome {
                pid,
                success,
                information: note.information,
                error: note.error,
            }
        }
    }
}

fn spawn_failure(reason: String) -> WorkerOutcome {
    WorkerOutcome {
        pid: None,
        success: false,
        information: None,
        error: Some(reason),
    }
}

enum SupervisionResult {
    Exited,
    Killed { reason: String },
}

/// The sampling loop: poll the worker's exit status, cumulative RSS across
/// its process tree, and elapsed wall-clock time (§4.1).
async fn supervise(
    child: &mut Child,
    pid: Option<u32>,
    request: &WorkerSpawnRequest,
    limits: &ResourceLimitsConfig,
) -> SupervisionResult {
    let started = Instant::now();
    let mut system = System::new();
    let memory_limit_bytes = system_memory_limit_bytes(limits.memory_percent);

    loop {
        match child.try_wait() {
            Ok(Some(_status)) => return SupervisionResult::Exited,
            Ok(None) => {}
            Err(e) => {
                warn!("error polling worker status: {e}");
                return SupervisionResult::Exited;
            }
        }

        if let Some(pid) = pid {
            let usage = tree_resident_memory_bytes(&mut system, pid);
            if usage > memory_limit_bytes {
                let reason = format!(
                    "Total memory usage exceeded limit: {usage} bytes > {memory_limit_bytes} bytes"
                );
                terminate_tree(child, pid, limits).await;
                return SupervisionResult::Killed { reason };
            }
        }

        if started.elapsed() > limits.wall_clock_limit {
            let reason = format!(
                "Wall clock time exceeded limit of {:?}",
                limits.wall_clock_limit
            );
            if let Some(pid) = pid {
                terminate_tree(child, pid, limits).await;
            }
            return SupervisionResult::Killed { reason };
        }

        sleep(limits.memory_check_interval).await;
    }
}

fn system_memory_limit_bytes(memory_percent: f64) -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    ((system.total_memory() as f64) * memory_percent / 100.0) as u64
}

/// Sums resident memory for `pid` and every process whose parent chain
/// leads back to it, matching §4.1's "worker and all descendants".
fn tree_resident_memory_bytes(system: &mut System, pid: u32) -> u64 {
    system.refresh_all();
    let root = Pid::from_u32(pid);
    let mut total = 0u64;
    let mut stack = vec![root];
    let mut visited = std::collections::HashSet::new();

    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(process) = system.process(current) {
            total += process.memory();
        }
        for (candidate_pid, process) in system.processes() {
            if process.parent() == Some(current) && !visited.contains(candidate_pid) {
                stack.push(*candidate_pid);
            }
        }
    }
    total
}

/// Graceful-stop then force-kill, with bounded waits (§4.1).
async fn terminate_tree(child: &mut Child, pid: u32, limits: &ResourceLimitsConfig) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid as NixPid;
        let pgid = NixPid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    if tokio::time::timeout(limits.termination_grace_period, child.wait())
        .await
        .is_ok()
    {
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid as NixPid;
        let pgid = NixPid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if tokio::time::timeout(limits.termination_grace_period, child.wait())
        .await
        .is_err()
    {
        warn!("worker {pid} did not exit after SIGKILL, giving up");
    }
}

fn append_diagnostic(err_path: &Path, reason: &str) {
    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(err_path) {
        let _ = writeln!(file, "{reason}");
    }
}

/// Classifies a worker's error output (§4.1). Reads `err_path` line by
/// line; an absent or empty file is a clean success. Pure over file
/// contents via [`classify_text`] so it's unit-testable without touching
/// the filesystem.
pub fn classify(err_path: &Path, ignorable: &[Regex]) -> (bool, ClassificationNote) {
    match std::fs::read_to_string(err_path) {
        Ok(contents) => classify_text(&contents, ignorable),
        Err(_) => (
            true,
            ClassificationNote {
                information: None,
                error: None,
            },
        ),
    }
}

pub fn classify_text(contents: &str, ignorable: &[Regex]) -> (bool, ClassificationNote) {
    if contents.trim().is_empty() {
        return (
            true,
            ClassificationNote {
                information: None,
                error: None,
            },
        );
    }

    let error_pattern = Regex::new(r"Error:\s*(.+)$").expect("valid regex");
    let mut last_non_blank: Option<String> = None;
    let mut error_line: Option<String> = None;

    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.chars().all(|c| c == '-' || c.is_whitespace()) {
            last_non_blank = Some(trimmed.to_string());
        }
        if let Some(captures) = error_pattern.captures(trimmed) {
            if let Some(m) = captures.get(1) {
                error_line = Some(m.as_str().trim().to_string());
            }
        }
    }

    let effective_line = error_line.or(last_non_blank).unwrap_or_default();

    if ignorable.iter().any(|pattern| pattern.is_match(&effective_line)) {
        (
            true,
            ClassificationNote {
                information: Some(effective_line),
                error: None,
            },
        )
    } else {
        (
            false,
            ClassificationNote {
                information: None,
                error: Some(format!("REDUCTION: {effective_line}")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(strs: &[&str]) -> Vec<Regex> {
        strs.iter().map(|s| Regex::new(s).unwrap()).collect()
    }

    #[test]
    fn empty_file_is_success() {
        let (success, note) = classify_text("", &[]);
        assert!(success);
        assert!(note.information.is_none());
        assert!(note.error.is_none());
    }

    #[test]
    fn whitespace_only_is_success() {
        let (success, _) = classify_text("   \n  \n", &[]);
        assert!(success);
    }

    #[test]
    fn ignorable_pattern_downgrades_to_success() {
        let ignorable = patterns(&["Error in logging framework"]);
        let (success, note) =
            classify_text("Error: Error in logging framework\n", &ignorable);
        assert!(success);
        assert_eq!(note.information.as_deref(), Some("Error in logging framework"));
        assert!(note.error.is_none());
    }

    #[test]
    fn non_matching_error_is_failure() {
        let ignorable = patterns(&["Error in logging framework"]);
        let (success, note) = classify_text("Error: disk is full\n", &ignorable);
        assert!(!success);
        assert_eq!(note.error.as_deref(), Some("REDUCTION: disk is full"));
    }

    #[test]
    fn last_error_line_wins() {
        let (success, note) = classify_text(
            "Error: first problem\nsome trace\nError: second problem\n",
            &[],
        );
        assert!(!success);
        assert_eq!(note.error.as_deref(), Some("REDUCTION: second problem"));
    }

    #[test]
    fn falls_back_to_last_non_blank_line_without_error_marker() {
        let (success, note) = classify_text("stack trace line one\nstack trace line two\n", &[]);
        assert!(!success);
        assert_eq!(note.error.as_deref(), Some("REDUCTION: stack trace line two"));
    }

    #[test]
    fn dash_only_lines_are_ignored_for_last_non_blank() {
        let (_, note) = classify_text("real message\n----------\n", &[]);
        assert_eq!(note.error.as_deref(), Some("REDUCTION: real message"));
    }

    #[test]
    fn classification_is_idempotent() {
        let text = "Error: flaky thing\n";
        let (s1, n1) = classify_text(text, &[]);
        let (s2, n2) = classify_text(text, &[]);
        assert_eq!(s1, s2);
        assert_eq!(n1.error, n2.error);
        assert_eq!(n1.information, n2.information);
    }
}
