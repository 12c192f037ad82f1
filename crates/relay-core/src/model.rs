use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_HOSTNAME: &str = "unknown";
pub const CANCELLED_REASON: &str = "cancelled by operator";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub const ALL: [CommandStatus; 5] = [
        CommandStatus::Pending,
        CommandStatus::Running,
        CommandStatus::Completed,
        CommandStatus::Failed,
        CommandStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Timeout
        )
    }

    /// Edges of the command state machine. `Pending -> Failed` exists only for
    /// operator cancellation of a command no client has claimed yet.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (CommandStatus::Pending, CommandStatus::Running)
                | (CommandStatus::Pending, CommandStatus::Timeout)
                | (CommandStatus::Pending, CommandStatus::Failed)
                | (CommandStatus::Running, CommandStatus::Completed)
                | (CommandStatus::Running, CommandStatus::Failed)
                | (CommandStatus::Running, CommandStatus::Timeout)
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(CommandStatus::Pending),
            "running" => Ok(CommandStatus::Running),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "timeout" | "timed_out" => Ok(CommandStatus::Timeout),
            other => Err(format!("Unknown command status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Inactive,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the store keeps for a client. Liveness is not part of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: String,
    pub hostname: String,
    pub client_type: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub last_seen_ms: i64,
    #[serde(default)]
    pub last_command_id: Option<String>,
    pub registered_at_ms: i64,
}

impl ClientRecord {
    /// Folds a fresh registration into the stored record.
    ///
    /// The newer observation wins on descriptive fields; `last_seen_ms` never
    /// moves backwards.
    pub fn merge(self, incoming: ClientRecord) -> ClientRecord {
        if incoming.last_seen_ms < self.last_seen_ms {
            return self;
        }
        ClientRecord {
            client_id: self.client_id,
            hostname: incoming.hostname,
            client_type: incoming.client_type,
            ip_address: incoming.ip_address.or(self.ip_address),
            last_seen_ms: incoming.last_seen_ms,
            last_command_id: incoming.last_command_id.or(self.last_command_id),
            registered_at_ms: self.registered_at_ms,
        }
    }

    pub fn observe(&mut self, seen_at_ms: i64, last_command_id: Option<&str>) {
        self.last_seen_ms = self.last_seen_ms.max(seen_at_ms);
        if let Some(command_id) = last_command_id {
            self.last_command_id = Some(command_id.to_string());
        }
    }

    pub fn status_at(&self, now_ms: i64, heartbeat_timeout: Duration) -> ClientStatus {
        let timeout_ms = i64::try_from(heartbeat_timeout.as_millis()).unwrap_or(i64::MAX);
        if now_ms.saturating_sub(self.last_seen_ms) < timeout_ms {
            ClientStatus::Active
        } else {
            ClientStatus::Inactive
        }
    }

    pub fn to_client(&self, now_ms: i64, heartbeat_timeout: Duration) -> Client {
        Client {
            client_id: self.client_id.clone(),
            hostname: self.hostname.clone(),
            client_type: self.client_type.clone(),
            ip_address: self.ip_address.clone(),
            last_seen_ms: self.last_seen_ms,
            last_command_id: self.last_command_id.clone(),
            status: self.status_at(now_ms, heartbeat_timeout),
        }
    }
}

/// A client as callers see it, with status derived at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub client_id: String,
    pub hostname: String,
    pub client_type: String,
    pub ip_address: Option<String>,
    pub last_seen_ms: i64,
    pub last_command_id: Option<String>,
    pub status: ClientStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub command_id: String,
    pub client_id: String,
    pub command: String,
    pub params: Value,
    pub status: CommandStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at_ms: Option<i64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

impl Command {
    pub fn new(
        client_id: &str,
        command: &str,
        params: Value,
        timeout_secs: Option<u64>,
        now_ms: i64,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            command: command.to_string(),
            params,
            status: CommandStatus::Pending,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            timeout_secs,
            claimed_by: None,
            claimed_at_ms: None,
            exit_code: None,
            result: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Running deadline for this command, falling back to the relay default.
    pub fn running_deadline(&self, default: Duration) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn summary(&self) -> CommandSummary {
        CommandSummary {
            command_id: self.command_id.clone(),
            client_id: self.client_id.clone(),
            command: self.command.clone(),
            params: self.params.clone(),
            status: self.status,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            exit_code: self.exit_code,
        }
    }

    /// Applies `transition` if the command is still in `expected`.
    ///
    /// This is the only code path that changes `status`; both store backends
    /// call it while holding their write guard.
    pub fn apply_transition(
        &mut self,
        expected: CommandStatus,
        transition: Transition,
    ) -> RelayResult<()> {
        if self.status != expected {
            return Err(RelayError::Conflict {
                command_id: self.command_id.clone(),
                expected,
                actual: self.status,
            });
        }
        if !expected.can_transition_to(transition.to) {
            return Err(RelayError::validation(format!(
                "illegal transition {expected} -> {}",
                transition.to
            )));
        }

        let at_ms = transition.at_ms.max(self.updated_at_ms + 1);
        match transition.to {
            CommandStatus::Running => {
                let Some(claimant) = transition.claimed_by else {
                    return Err(RelayError::validation("claim requires a claimant"));
                };
                self.claimed_by = Some(claimant);
                self.claimed_at_ms = Some(at_ms);
            }
            CommandStatus::Completed | CommandStatus::Failed => {
                self.exit_code = transition.exit_code;
                self.result = transition.result;
                self.stdout = transition.stdout;
                self.stderr = transition.stderr;
            }
            CommandStatus::Timeout | CommandStatus::Pending => {}
        }
        self.status = transition.to;
        self.updated_at_ms = at_ms;
        Ok(())
    }
}

/// List form of a command: no result, stdout or stderr.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSummary {
    pub command_id: String,
    pub client_id: String,
    pub command: String,
    pub params: Value,
    pub status: CommandStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFilter {
    pub client_id: Option<String>,
    pub status: Option<CommandStatus>,
    pub limit: Option<usize>,
}

impl CommandFilter {
    pub fn for_client(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Self::default()
        }
    }

    pub fn in_status(status: CommandStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: CommandStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, command: &Command) -> bool {
        if let Some(client_id) = &self.client_id {
            if &command.client_id != client_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if command.status != status {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Completed,
    Failed,
}

impl ReportOutcome {
    pub fn status(&self) -> CommandStatus {
        match self {
            ReportOutcome::Completed => CommandStatus::Completed,
            ReportOutcome::Failed => CommandStatus::Failed,
        }
    }
}

/// Terminal outcome a client reports for a command it claimed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandReport {
    pub outcome: ReportOutcome,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

impl CommandReport {
    pub fn completed(exit_code: i32) -> Self {
        Self {
            outcome: ReportOutcome::Completed,
            exit_code: Some(exit_code),
            result: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            outcome: ReportOutcome::Failed,
            ..Self::completed(exit_code)
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = Some(stdout.to_string());
        self
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = Some(stderr.to_string());
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: CommandStatus,
    pub at_ms: i64,
    pub claimed_by: Option<String>,
    pub exit_code: Option<i32>,
    pub result: Option<Value>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Transition {
    fn bare(to: CommandStatus, at_ms: i64) -> Self {
        Self {
            to,
            at_ms,
            claimed_by: None,
            exit_code: None,
            result: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn claim(client_id: &str, at_ms: i64) -> Self {
        Self {
            claimed_by: Some(client_id.to_string()),
            ..Self::bare(CommandStatus::Running, at_ms)
        }
    }

    pub fn report(report: CommandReport, at_ms: i64) -> Self {
        Self {
            exit_code: report.exit_code,
            result: report.result,
            stdout: report.stdout,
            stderr: report.stderr,
            ..Self::bare(report.outcome.status(), at_ms)
        }
    }

    pub fn timeout(at_ms: i64) -> Self {
        Self::bare(CommandStatus::Timeout, at_ms)
    }

    pub fn cancel(reason: &str, at_ms: i64) -> Self {
        Self {
            result: Some(serde_json::json!({ "cancelled": true })),
            stderr: Some(reason.to_string()),
            ..Self::bare(CommandStatus::Failed, at_ms)
        }
    }
}
