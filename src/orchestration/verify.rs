//! Post-merge verification command.
//!
//! The command runs through `sh -c` in the staging directory. A timeout is a
//! failed verification, never an ambiguous one: the child is killed and the
//! outcome reports `timed_out`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::config::DEFAULT_VERIFY_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::{cxlog, cxlog_debug, cxlog_trace, cxlog_warn};

/// Result of running (or skipping) verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// `None` when no command ran.
    pub tests_passed: Option<bool>,
    /// Captured stdout followed by stderr.
    pub output: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl VerificationOutcome {
    pub fn skipped(reason: &str) -> Self {
        Self {
            tests_passed: None,
            output: reason.to_string(),
            timed_out: false,
        }
    }

    pub fn failed(&self) -> bool {
        self.tests_passed == Some(false)
    }
}

/// Verification command bound to a timeout.
#[derive(Debug, Clone)]
pub struct Verifier {
    command: String,
    timeout: Duration,
}

impl Verifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the command and fold every failure mode into the outcome.
    pub async fn run(&self, cwd: &Path) -> VerificationOutcome {
        cxlog!("Running verification: {} (timeout {:?})", self.command, self.timeout);
        match self.execute(cwd).await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let passed = output.status.success();
                if passed {
                    cxlog_debug!("Verification passed");
                } else {
                    cxlog_warn!(
                        "Verification failed with exit code {}",
                        output.status.code().unwrap_or(-1)
                    );
                }
                cxlog_trace!("Verification output:\n{}", text);
                VerificationOutcome {
                    tests_passed: Some(passed),
                    output: text,
                    timed_out: false,
                }
            }
            Err(Error::Timeout(after)) => {
                cxlog_warn!("Verification timed out after {:?}", after);
                VerificationOutcome {
                    tests_passed: Some(false),
                    output: format!("Verification timed out (>{}s)", after.as_secs_f64()),
                    timed_out: true,
                }
            }
            Err(e) => {
                cxlog_warn!("Verification could not run: {}", e);
                VerificationOutcome {
                    tests_passed: Some(false),
                    output: format!("Verification error: {}", e),
                    timed_out: false,
                }
            }
        }
    }

    /// Spawn the command and wait for it, bounded by the timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the command outlives the timeout; the child is killed
    /// - [`Error::Io`] if the shell cannot be spawned
    pub async fn execute(&self, cwd: &Path) -> Result<Output> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        Ok(output)
    }
}
