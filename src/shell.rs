// ============================================================================
// REMOTE SHELL EXECUTOR
// ============================================================================
// Runs commands on the appliance over SSH:
// - log tails for the shell fallback source
// - alert queries against the appliance's local document store
// Every command is bounded by the configured timeout.
// ============================================================================

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::ShellConfig;
use crate::error::{CollectorError, CollectorResult};

const CHANNEL: &str = "ssh";

/// Command execution on the appliance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShellExecutor: Send + Sync {
    /// Last `max_lines` lines of the file at `path`.
    async fn read_log_lines(&self, path: &str, max_lines: usize) -> CollectorResult<Vec<String>>;

    /// Raw IDS/IPS alert records newer than `since`, newest first.
    async fn query_alert_records(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> CollectorResult<Vec<JsonValue>>;
}

/// [`ShellExecutor`] backed by the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: ShellConfig,
    program: String,
}

impl SshExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            program: "ssh".into(),
        }
    }

    /// Use a different client binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.username, self.config.host)
    }

    /// Arguments passed to the client for `remote_command`.
    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.timeout.as_secs().max(1)),
            "-p".to_string(),
            self.config.port.to_string(),
        ];
        if let Some(key) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(self.destination());
        args.push(remote_command.to_string());
        args
    }

    async fn run(&self, remote_command: &str) -> CollectorResult<String> {
        trace!(target: "vigil::collector::shell",
            host = %self.config.host,
            command = remote_command,
            "Running remote command");

        let mut command = Command::new(&self.program);
        command
            .args(self.ssh_args(remote_command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, command.output())
            .await
            .map_err(|_| CollectorError::timeout(remote_command, duration_ms(self.config.timeout)))?
            .map_err(|e| CollectorError::connection_failed(self.destination(), e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollectorError::collection_failed(
                CHANNEL,
                format!("'{}' exited with {}: {}", remote_command, output.status, stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ShellExecutor for SshExecutor {
    async fn read_log_lines(&self, path: &str, max_lines: usize) -> CollectorResult<Vec<String>> {
        let command = format!("tail -n {} {}", max_lines, shell_quote(path));
        let stdout = self.run(&command).await?;
        let lines: Vec<String> = stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect();
        debug!(target: "vigil::collector::shell", path = path, lines = lines.len(), "Log lines read");
        Ok(lines)
    }

    async fn query_alert_records(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> CollectorResult<Vec<JsonValue>> {
        let command = alert_query_command(self.config.store_port, since, limit);
        let stdout = self.run(&command).await?;
        let records = parse_alert_output(&stdout)?;
        debug!(target: "vigil::collector::shell", records = records.len(), "Alert records queried");
        Ok(records)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Store query printing alerts newer than `since` as one JSON array.
pub fn alert_query_command(port: u16, since: DateTime<Utc>, limit: usize) -> String {
    let script = format!(
        "JSON.stringify(db.alert.find({{time: {{$gte: {}}}}}).sort({{time: -1}}).limit({}).toArray())",
        since.timestamp_millis(),
        limit
    );
    format!("mongo --quiet --port {} ace --eval {}", port, shell_quote(&script))
}

/// Extract the JSON array from the store shell's output, skipping any banner.
pub fn parse_alert_output(stdout: &str) -> CollectorResult<Vec<JsonValue>> {
    let start = stdout
        .find('[')
        .ok_or_else(|| CollectorError::invalid_response(CHANNEL, "no JSON array in store output"))?;
    let parsed: JsonValue = serde_json::from_str(stdout[start..].trim())
        .map_err(|e| CollectorError::invalid_response(CHANNEL, format!("bad store output: {}", e)))?;
    match parsed {
        JsonValue::Array(items) => Ok(items),
        _ => Err(CollectorError::invalid_response(CHANNEL, "store output is not an array")),
    }
}
