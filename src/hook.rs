use log::{error, info, warn};
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

const WAIT_POLL: Duration = Duration::from_millis(25);

/// Role-transition hooks. Start/stop bracket normal leadership; fence runs
/// on an unhealthy exit to cut clients off from a possibly-broken master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    LeaderStart,
    LeaderStop,
    LeaderFence,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::LeaderStart => "leader_start",
            HookKind::LeaderStop => "leader_stop",
            HookKind::LeaderFence => "leader_fence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Includes the no-op case of an unconfigured hook.
    Success,
    Failed { code: Option<i32> },
    TimedOut,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to spawn shell for {kind} hook: {source}")]
    Spawn {
        kind: &'static str,
        source: std::io::Error,
    },
}

/// Runs configured shell commands with a bounded execution window.
///
/// A non-zero exit is reported but never fatal: the role transition that
/// triggered the hook completes regardless. Callers serialize invocations;
/// the runner itself holds no state between runs.
pub struct HookRunner {
    start_command: String,
    stop_command: String,
    fence_command: String,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(
        start_command: String,
        stop_command: String,
        fence_command: String,
        timeout: Duration,
    ) -> Self {
        Self {
            start_command,
            stop_command,
            fence_command,
            timeout,
        }
    }

    pub fn run(&self, kind: HookKind) -> Result<HookOutcome, HookError> {
        let command = match kind {
            HookKind::LeaderStart => &self.start_command,
            HookKind::LeaderStop => &self.stop_command,
            HookKind::LeaderFence => &self.fence_command,
        };
        if command.is_empty() {
            info!("event=hook_skipped kind={} reason=unconfigured", kind.as_str());
            return Ok(HookOutcome::Success);
        }

        let start = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| HookError::Spawn {
                kind: kind.as_str(),
                source,
            })?;

        let deadline = start + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    std::thread::sleep(WAIT_POLL);
                }
                Err(err) => {
                    warn!(
                        "event=hook_wait_error kind={} error={err}",
                        kind.as_str()
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
            }
        };

        let output = collect_output(&mut child);
        let elapsed = start.elapsed();
        match status {
            Some(status) if status.success() => {
                info!(
                    "event=hook_done kind={} elapsed_ms={} output={:?}",
                    kind.as_str(),
                    elapsed.as_millis(),
                    output
                );
                Ok(HookOutcome::Success)
            }
            Some(status) => {
                let code = status.code();
                if kind == HookKind::LeaderFence {
                    error!(
                        "event=hook_failed kind={} code={:?} output={:?}",
                        kind.as_str(),
                        code,
                        output
                    );
                } else {
                    warn!(
                        "event=hook_failed kind={} code={:?} output={:?}",
                        kind.as_str(),
                        code,
                        output
                    );
                }
                Ok(HookOutcome::Failed { code })
            }
            None => {
                error!(
                    "event=hook_timeout kind={} timeout_ms={} output={:?}",
                    kind.as_str(),
                    self.timeout.as_millis(),
                    output
                );
                Ok(HookOutcome::TimedOut)
            }
        }
    }
}

fn collect_output(child: &mut std::process::Child) -> String {
    let mut combined = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = stdout.read_to_string(&mut combined);
    }
    if let Some(mut stderr) = child.stderr.take() {
        let mut err = String::new();
        let _ = stderr.read_to_string(&mut err);
        if !err.is_empty() {
            if !combined.is_empty() {
                combined.push(' ');
            }
            combined.push_str(&err);
        }
    }
    combined.truncate(combined.trim_end().len());
    combined
}
