// Dispatch core — Sandbox launcher.
//
// On macOS (the OS-level sandbox facility available to this crate), wraps
// the command in `sandbox-exec` with a generated Seatbelt profile that
// denies network and IPC/mach-lookup, allows reads everywhere, and allows
// writes only under the given ephemeral roots. On every other platform the
// command runs directly with a whitelisted environment and the given cwd —
// there is no portable process-sandboxing facility in the standard
// toolchain to fall back to.
//
// Either way, the timeout and combined-output-size caps are enforced here,
// not by the caller: on expiry the whole process group is killed so no
// grandchildren survive the deadline.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{EngineError, EngineResult};
use crate::util::truncate_utf8;

const WHITELISTED_ENV: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"];

#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Execute `cmd` via `sh -c` under `cwd`, enforcing `timeout` and
/// `max_output` bytes of combined stdout+stderr. `ephemeral_roots` are the
/// only paths the sandboxed process may write under (macOS only — the
/// generic fallback has no enforcement mechanism for this beyond the
/// caller's own path validation).
pub async fn run(
    cmd: &str,
    cwd: &Path,
    timeout_duration: Duration,
    max_output: usize,
    ephemeral_roots: &[PathBuf],
) -> EngineResult<SandboxResult> {
    let mut command = build_command(cmd, cwd, ephemeral_roots);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use tokio::process::CommandExt;
        // Put the child in its own process group so a timeout kill takes
        // any subprocess it spawned down with it.
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = command
        .spawn()
        .map_err(|e| EngineError::Process(format!("failed to spawn sandboxed command: {e}")))?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    let read_both = async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let (so, se) = tokio::join!(
            stdout_pipe.read_to_end(&mut stdout_buf),
            stderr_pipe.read_to_end(&mut stderr_buf),
        );
        so.ok();
        se.ok();
        (stdout_buf, stderr_buf)
    };

    let wait_fut = async {
        let (stdout_buf, stderr_buf) = read_both.await;
        let status = child.wait().await;
        (stdout_buf, stderr_buf, status)
    };

    match timeout(timeout_duration, wait_fut).await {
        Ok((stdout_buf, stderr_buf, status)) => {
            let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            Ok(SandboxResult {
                stdout: truncate_output(&String::from_utf8_lossy(&stdout_buf), max_output),
                stderr: truncate_output(&String::from_utf8_lossy(&stderr_buf), max_output),
                exit_code,
                timed_out: false,
            })
        }
        Err(_) => {
            kill_process_group(&child);
            let _ = child.kill().await;
            Ok(SandboxResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}

fn build_command(cmd: &str, cwd: &Path, ephemeral_roots: &[PathBuf]) -> Command {
    if cfg!(target_os = "macos") && which_sandbox_exec().is_some() {
        let profile = seatbelt_profile(ephemeral_roots);
        let mut command = Command::new("sandbox-exec");
        command.arg("-p").arg(profile).arg("sh").arg("-c").arg(cmd);
        apply_whitelisted_env(&mut command);
        command.current_dir(cwd);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        apply_whitelisted_env(&mut command);
        command.current_dir(cwd);
        command
    }
}

fn apply_whitelisted_env(command: &mut Command) {
    command.env_clear();
    for key in WHITELISTED_ENV {
        if let Ok(val) = std::env::var(key) {
            command.env(key, val);
        }
    }
}

fn which_sandbox_exec() -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join("sandbox-exec"))
            .find(|p| p.is_file())
    })
}

/// A minimal Seatbelt profile: deny everything by default, then carve out
/// the read/write/process exceptions the sandboxed command needs. Network
/// and mach lookups (IPC) stay denied.
fn seatbelt_profile(ephemeral_roots: &[PathBuf]) -> String {
    let mut profile = String::from(
        "(version 1)\n\
         (deny default)\n\
         (allow process-fork)\n\
         (allow process-exec)\n\
         (allow file-read*)\n\
         (deny network*)\n\
         (deny mach-lookup)\n",
    );
    for root in ephemeral_roots {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            root.display()
        ));
    }
    profile
}

fn kill_process_group(child: &tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
}

fn truncate_output(s: &str, max_output: usize) -> String {
    if s.len() <= max_output {
        return s.to_string();
    }
    format!("{}\n... [output truncated]", truncate_utf8(s, max_output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let result = run("echo hello", dir.path(), Duration::from_secs(5), 10_000, &[]).await.unwrap();
        assert!(result.stdout.contains("hello"));
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn run_enforces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let result = run("sleep 5", dir.path(), Duration::from_millis(100), 10_000, &[]).await.unwrap();
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn run_truncates_large_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(
            "yes x | head -c 100000",
            dir.path(),
            Duration::from_secs(10),
            500,
            &[],
        )
        .await
        .unwrap();
        assert!(result.stdout.len() < 1000);
        assert!(result.stdout.contains("truncated"));
    }

    #[test]
    fn seatbelt_profile_denies_network_and_mach_lookup() {
        let profile = seatbelt_profile(&[PathBuf::from("/tmp/x")]);
        assert!(profile.contains("deny network"));
        assert!(profile.contains("deny mach-lookup"));
        assert!(profile.contains("/tmp/x"));
    }
}
