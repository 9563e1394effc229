//! Command Runner: executes one command over a pooled SSH session
//! with retry/backoff and sudo escalation.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use ssh2::Session;

use crate::error::RangeError;

const PRIVILEGED_COMMANDS: &[&str] = &[
    "useradd", "usermod", "userdel", "apt-get", "apt", "yum", "dnf", "zypper", "systemctl",
    "iptables", "mount", "umount", "chocolatey",
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `k` (1-indexed): base delay scaled by
    /// `multiplier^(k-1)`, capped at `max_delay`, plus a small jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.1 * random_unit();
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// A uniform `[0, 1)` float, rand_core-backed the same way the codebase
/// generates operator keypairs (`provider/kvm.rs`) and gateway passwords
/// (`gateway/service.rs`).
fn random_unit() -> f64 {
    (OsRng.next_u32() as f64) / (u32::MAX as f64 + 1.0)
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub user: String,
    pub expected_codes: Vec<i32>,
    pub ignore_errors: bool,
    pub retry: Option<RetryPolicy>,
    pub retry_on_nonzero_exit: bool,
}

fn is_retryable_transport_error(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("connection refused")
        || m.contains("connection reset")
        || m.contains("timed out")
        || m.contains("timeout")
        || m.contains("temporarily unavailable")
        || m.contains("resource temporarily unavailable")
}

/// Prepends `sudo` when the target user is non-root and the command's
/// first token is in the known privileged set.
fn maybe_escalate(argv: &[String], user: &str) -> Vec<String> {
    if user == "root" {
        return argv.to_vec();
    }
    let is_privileged = argv
        .first()
        .map(|cmd| PRIVILEGED_COMMANDS.contains(&cmd.as_str()))
        .unwrap_or(false);
    if is_privileged {
        let mut escalated = vec!["sudo".to_string()];
        escalated.extend_from_slice(argv);
        escalated
    } else {
        argv.to_vec()
    }
}

fn quote_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c)) {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `argv` on `session`, retrying transport-level failures according to
/// `options.retry`. Non-zero exits are retried only when
/// `retry_on_nonzero_exit` is set.
pub async fn run(
    session: Arc<Session>,
    host: &str,
    argv: &[String],
    options: &RunOptions,
) -> Result<CommandOutput, RangeError> {
    let policy = options.retry.clone().unwrap_or_default();
    let escalated = maybe_escalate(argv, &options.user);
    let command_line = quote_argv(&escalated);

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let started = Instant::now();
        let outcome = exec_once(session.clone(), &command_line).await;

        match outcome {
            Ok((exit_code, stdout, stderr)) => {
                let success =
                    options.expected_codes.contains(&exit_code) || options.ignore_errors;
                let output = CommandOutput {
                    exit_code,
                    stdout,
                    stderr,
                    elapsed: started.elapsed(),
                    success,
                };
                if !success && options.retry_on_nonzero_exit && attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    continue;
                }
                return Ok(output);
            }
            Err(e) => {
                let retryable = is_retryable_transport_error(&e.to_string());
                if retryable && attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    continue;
                }
                return Err(RangeError::Ssh {
                    host: host.to_string(),
                    message: e.to_string(),
                    retryable,
                });
            }
        }
    }
}

async fn exec_once(
    session: Arc<Session>,
    command_line: &str,
) -> Result<(i32, String, String), String> {
    let command_line = command_line.to_string();
    tokio::task::spawn_blocking(move || -> Result<(i32, String, String), String> {
        let mut channel = session.channel_session().map_err(|e| e.to_string())?;
        channel.exec(&command_line).map_err(|e| e.to_string())?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| e.to_string())?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| e.to_string())?;

        channel.wait_close().map_err(|e| e.to_string())?;
        let exit_code = channel.exit_status().map_err(|e| e.to_string())?;
        Ok((exit_code, stdout, stderr))
    })
    .await
    .map_err(|e| e.to_string())?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_privileged_commands_for_non_root() {
        let argv = vec!["apt-get".to_string(), "install".to_string(), "-y".to_string(), "nmap".to_string()];
        let escalated = maybe_escalate(&argv, "ubuntu");
        assert_eq!(escalated[0], "sudo");
        assert_eq!(escalated[1], "apt-get");
    }

    #[test]
    fn does_not_escalate_for_root() {
        let argv = vec!["apt-get".to_string()];
        assert_eq!(maybe_escalate(&argv, "root"), argv);
    }

    #[test]
    fn does_not_escalate_unprivileged_commands() {
        let argv = vec!["echo".to_string(), "hi".to_string()];
        assert_eq!(maybe_escalate(&argv, "ubuntu"), argv);
    }

    #[test]
    fn retryable_transport_errors_recognised() {
        assert!(is_retryable_transport_error("Connection refused"));
        assert!(is_retryable_transport_error("operation timed out"));
        assert!(!is_retryable_transport_error("permission denied"));
    }

    #[test]
    fn delay_grows_with_attempt_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        };
        let d1 = policy.delay_for(1);
        let d3 = policy.delay_for(3);
        assert!(d1 <= Duration::from_millis(110));
        assert!(d3 <= Duration::from_secs(1) + Duration::from_millis(110));
    }

    #[test]
    fn quote_argv_escapes_special_chars() {
        let argv = vec!["echo".to_string(), "a b".to_string()];
        assert_eq!(quote_argv(&argv), "echo 'a b'");
    }
}
