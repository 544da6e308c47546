//! Subprocess invocation of the extraction tool with timeout, cancellation and group kill.

use super::{CancelToken, PluginResult, ToolError};
use crate::config::ToolConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STDERR_TAIL: usize = 512;

enum Outcome {
    Finished(std::io::Result<std::process::Output>),
    TimedOut,
    Cancelled,
}

pub struct PluginRunner {
    tool: ToolConfig,
}

impl PluginRunner {
    pub fn new(tool: ToolConfig) -> Self {
        Self { tool }
    }

    /// Argument vector passed to the tool (without the program itself).
    pub fn arguments(&self, dump_path: &Path, plugin: &str, plugin_dir: Option<&Path>) -> Vec<String> {
        let mut args = self.tool.args.clone();
        args.push("-f".to_string());
        args.push(dump_path.to_string_lossy().into_owned());
        if let (Some(flag), Some(dir)) = (self.tool.output_flag.as_ref(), plugin_dir) {
            args.push(flag.clone());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.push(plugin.to_string());
        args
    }

    /// Run one plugin. `workdir` is the run's scratch directory; each plugin gets its own subdirectory.
    pub async fn run(
        &self,
        dump_path: &Path,
        dump_id: &str,
        plugin: &str,
        timeout: Duration,
        workdir: Option<&Path>,
        cancel: &CancelToken,
    ) -> PluginResult {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return PluginResult::failed(plugin, dump_id, ToolError::Cancelled, started.elapsed());
        }

        let plugin_dir = match workdir {
            Some(dir) => {
                let d = dir.join(scratch_name(plugin));
                if let Err(e) = tokio::fs::create_dir_all(&d).await {
                    let err = ToolError::Io {
                        message: e.to_string(),
                    };
                    return PluginResult::failed(plugin, dump_id, err, started.elapsed());
                }
                Some(d)
            }
            None => None,
        };

        let mut std_cmd = std::process::Command::new(&self.tool.program);
        std_cmd
            .args(self.arguments(dump_path, plugin, plugin_dir.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let err = ToolError::NotFound {
                    program: self.tool.program.display().to_string(),
                };
                warn!(plugin, error = %err, "plugin not started");
                return PluginResult::failed(plugin, dump_id, err, started.elapsed());
            }
            Err(e) => {
                let err = ToolError::Spawn {
                    message: e.to_string(),
                };
                warn!(plugin, error = %err, "plugin not started");
                return PluginResult::failed(plugin, dump_id, err, started.elapsed());
            }
        };
        let child_id = child.id();
        debug!(plugin, pid = ?child_id, "plugin started");

        let outcome = tokio::select! {
            res = child.wait_with_output() => Outcome::Finished(res),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let result = match outcome {
            Outcome::Finished(Ok(output)) => self.finished(plugin, dump_id, output, started.elapsed()),
            Outcome::Finished(Err(e)) => {
                let err = ToolError::Io {
                    message: e.to_string(),
                };
                PluginResult::failed(plugin, dump_id, err, started.elapsed())
            }
            Outcome::TimedOut => {
                terminate_group(child_id);
                let err = ToolError::Timeout {
                    secs: timeout.as_secs(),
                };
                PluginResult::failed(plugin, dump_id, err, started.elapsed())
            }
            Outcome::Cancelled => {
                terminate_group(child_id);
                PluginResult::failed(plugin, dump_id, ToolError::Cancelled, started.elapsed())
            }
        };

        match &result.error {
            None => debug!(plugin, ms = result.duration.as_millis() as u64, "plugin finished"),
            Some(e) => warn!(plugin, error = %e, "plugin failed"),
        }
        result
    }

    fn finished(&self, plugin: &str, dump_id: &str, output: std::process::Output, duration: Duration) -> PluginResult {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_status = output.status.code();

        let (raw_output, encoding_error) = match String::from_utf8(output.stdout) {
            Ok(s) => (s, None),
            Err(e) => (
                String::from_utf8_lossy(e.as_bytes()).into_owned(),
                Some(ToolError::InvalidEncoding),
            ),
        };

        let error = match exit_status {
            None => Some(ToolError::Killed),
            Some(0) => encoding_error,
            Some(code) => Some(ToolError::NonZeroExit {
                code,
                stderr_tail: tail(&stderr, STDERR_TAIL),
            }),
        };

        PluginResult {
            plugin: plugin.to_string(),
            dump_id: dump_id.to_string(),
            raw_output,
            stderr,
            exit_status,
            duration,
            error,
        }
    }
}

/// Directory name for a plugin's scratch output (`windows.pslist` → `windows_pslist`).
fn scratch_name(plugin: &str) -> PathBuf {
    PathBuf::from(
        plugin
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>(),
    )
}

fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim_end();
    let mut start = trimmed.len().saturating_sub(max);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(unix)]
fn terminate_group(child_id: Option<u32>) {
    if let Some(pid) = child_id {
        // SAFETY: the child leads its own process group (process_group(0)); a stale id yields ESRCH.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_child_id: Option<u32>) {}
