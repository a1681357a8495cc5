//! Hard gate execution.
//!
//! Hard gates are commands that run directly as a child process - never via
//! a shell, never delegated to the agent - and block the workflow on
//! failure. The command string is split into argv with quote awareness and
//! executed with a wall-clock timeout; on timeout the process is killed and
//! the gate fails.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

/// Default command timeout: 5 minutes.
pub const DEFAULT_GATE_TIMEOUT_SECS: u64 = 300;
/// Raw output kept per stream before the caller applies its own limits.
const OUTPUT_CAPTURE_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCommandResult {
    pub success: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Executes hard-gate commands with a bounded wall clock.
#[derive(Debug, Clone)]
pub struct GateRunner {
    timeout_secs: u64,
}

impl Default for GateRunner {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_GATE_TIMEOUT_SECS,
        }
    }
}

impl GateRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Run `command` in `working_dir` and report the outcome. Never
    /// returns an `Err`: every failure mode is folded into the result so
    /// the state machine can record it as a gate failure.
    pub async fn execute(&self, command: &str, working_dir: &Path) -> GateCommandResult {
        let start = Instant::now();

        let argv = match split_command(command) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => {
                return self.failed(command, start, "Empty command".to_string());
            }
            Err(e) => {
                return self.failed(command, start, format!("Invalid command syntax: {e}"));
            }
        };

        tracing::info!(command, "executing hard gate");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return self.failed(command, start, format!("Failed to spawn command: {e}"));
            }
        };

        match timeout(Duration::from_secs(self.timeout_secs), child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                GateCommandResult {
                    success: output.status.success(),
                    exit_code,
                    stdout: capture(&output.stdout),
                    stderr: capture(&output.stderr),
                    command: command.to_string(),
                    error: None,
                    duration_seconds: Some(start.elapsed().as_secs_f64()),
                }
            }
            Ok(Err(e)) => self.failed(command, start, format!("Command failed: {e}")),
            Err(_) => {
                tracing::error!(command, timeout_secs = self.timeout_secs, "gate command timed out");
                self.failed(
                    command,
                    start,
                    format!("Command timed out after {} seconds", self.timeout_secs),
                )
            }
        }
    }

    fn failed(&self, command: &str, start: Instant, error: String) -> GateCommandResult {
        GateCommandResult {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            command: command.to_string(),
            error: Some(error),
            duration_seconds: Some(start.elapsed().as_secs_f64()),
        }
    }
}

fn capture(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars().take(OUTPUT_CAPTURE_LIMIT).collect()
}

/// Split a command string into argv, honoring single and double quotes.
pub fn split_command(command: &str) -> Result<Vec<String>, String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        argv.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        argv.push(current);
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn split_handles_plain_words() {
        assert_eq!(
            split_command("cargo test --lib").unwrap(),
            vec!["cargo", "test", "--lib"]
        );
    }

    #[test]
    fn split_honors_quotes() {
        assert_eq!(
            split_command(r#"grep "two words" 'single quoted' file"#).unwrap(),
            vec!["grep", "two words", "single quoted", "file"]
        );
    }

    #[test]
    fn split_rejects_unterminated_quote() {
        assert!(split_command(r#"echo "open"#).is_err());
    }

    #[test]
    fn split_empty_is_empty() {
        assert!(split_command("   ").unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_command_reports_exit_zero() {
        let dir = TempDir::new().unwrap();
        let result = GateRunner::default().execute("true", dir.path()).await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.error.is_none());
        assert!(result.duration_seconds.is_some());
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let result = GateRunner::default().execute("false", dir.path()).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn missing_binary_is_a_gate_failure_not_a_panic() {
        let dir = TempDir::new().unwrap();
        let result = GateRunner::default()
            .execute("definitely_not_a_real_binary_xyz", dir.path())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn timeout_kills_and_fails() {
        let dir = TempDir::new().unwrap();
        let runner = GateRunner::new(1);
        let result = runner.execute("sleep 10", dir.path()).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.unwrap().contains("timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn stdout_is_captured() {
        let dir = TempDir::new().unwrap();
        let result = GateRunner::default().execute("echo hello", dir.path()).await;
        assert!(result.success);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = GateRunner::default().execute("  ", dir.path()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Empty command"));
    }
}
