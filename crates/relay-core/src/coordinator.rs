use crate::clock::Clock;
use crate::commands::CommandStore;
use crate::dispatcher::{CancelOutcome, Deadlines, Dispatcher, SweepReport};
use crate::error::{RelayError, RelayResult};
use crate::model::{Client, Command, CommandFilter, CommandReport, CommandSummary};
use crate::notifier::{EventNotifier, Subscription, DEFAULT_EVENT_BACKLOG};
use crate::registry::{ClientRegistry, Registration, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::store::RelayStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;
pub const MAX_COMMAND_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub heartbeat_timeout: Duration,
    pub deadlines: Deadlines,
    pub event_backlog: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            deadlines: Deadlines::default(),
            event_backlog: DEFAULT_EVENT_BACKLOG,
        }
    }
}

/// Operator request to run a command on one client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitCommand {
    pub client_id: String,
    pub command: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Running deadline for this command only, in seconds.
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
}

/// Boundary operations for client agents and operator consoles.
///
/// Input is validated here, before any component touches the store.
pub struct Coordinator {
    registry: Arc<ClientRegistry>,
    commands: Arc<CommandStore>,
    dispatcher: Dispatcher,
    notifier: Arc<EventNotifier>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RelayStore>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        let notifier = Arc::new(EventNotifier::new(config.event_backlog));
        let registry = Arc::new(ClientRegistry::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            config.heartbeat_timeout,
        ));
        let commands = Arc::new(CommandStore::new(store, clock, notifier.clone()));
        let dispatcher = Dispatcher::new(commands.clone(), registry.clone(), config.deadlines);
        Self {
            registry,
            commands,
            dispatcher,
            notifier,
        }
    }

    pub fn register_client(&self, registration: Registration) -> RelayResult<Client> {
        self.registry.register(registration)
    }

    pub fn heartbeat(&self, client_id: &str, last_command_id: Option<&str>) -> RelayResult<Client> {
        require_non_empty("client_id", client_id)?;
        self.registry.heartbeat(client_id, last_command_id)
    }

    pub fn list_clients(&self) -> RelayResult<Vec<Client>> {
        self.registry.list()
    }

    pub fn get_client(&self, client_id: &str) -> RelayResult<Client> {
        self.registry.get(client_id)
    }

    pub fn submit_command(&self, request: SubmitCommand) -> RelayResult<Command> {
        require_non_empty("client_id", &request.client_id)?;
        let command = request.command.trim();
        require_non_empty("command", command)?;
        if command.len() > MAX_COMMAND_BYTES {
            return Err(RelayError::validation(format!(
                "command exceeds {MAX_COMMAND_BYTES} bytes"
            )));
        }
        let params = match request.params {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => return Err(RelayError::validation("params must be a JSON object")),
        };
        if request.timeout_secs == Some(0) {
            return Err(RelayError::validation("timeout must be positive"));
        }
        self.commands
            .create(&request.client_id, command, params, request.timeout_secs)
    }

    pub fn get_command(&self, command_id: &str) -> RelayResult<Command> {
        self.commands.get(command_id)
    }

    /// Newest first; the limit defaults to [`DEFAULT_LIST_LIMIT`] and is capped
    /// at [`MAX_LIST_LIMIT`].
    pub fn list_commands(&self, filter: CommandFilter) -> RelayResult<Vec<CommandSummary>> {
        let limit = match filter.limit {
            Some(0) => return Err(RelayError::validation("limit must be positive")),
            Some(limit) => limit.min(MAX_LIST_LIMIT),
            None => DEFAULT_LIST_LIMIT,
        };
        let filter = filter.with_limit(limit);
        Ok(self
            .commands
            .list(&filter)?
            .iter()
            .map(Command::summary)
            .collect())
    }

    pub fn claim(&self, command_id: &str, client_id: &str) -> RelayResult<Command> {
        require_non_empty("client_id", client_id)?;
        self.dispatcher.claim(command_id, client_id)
    }

    pub fn poll(&self, client_id: &str) -> RelayResult<Vec<Command>> {
        self.dispatcher.poll(client_id)
    }

    pub fn report(
        &self,
        command_id: &str,
        reporter: Option<&str>,
        report: CommandReport,
    ) -> RelayResult<Command> {
        if let Some(reporter) = reporter {
            require_non_empty("client_id", reporter)?;
        }
        self.dispatcher.report(command_id, reporter, report)
    }

    pub fn cancel(&self, command_id: &str, reason: Option<&str>) -> RelayResult<CancelOutcome> {
        self.dispatcher.cancel(command_id, reason)
    }

    pub fn sweep(&self) -> RelayResult<SweepReport> {
        self.dispatcher.sweep()
    }

    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    pub fn deadlines(&self) -> Deadlines {
        self.dispatcher.deadlines()
    }
}

fn require_non_empty(field: &str, value: &str) -> RelayResult<()> {
    if value.trim().is_empty() {
        return Err(RelayError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::CommandStatus;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn coordinator() -> (Coordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let coordinator = Coordinator::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            CoordinatorConfig::default(),
        );
        coordinator
            .register_client(Registration {
                client_id: Some("c1".to_string()),
                client_type: "linux".to_string(),
                hostname: Some("db-01".to_string()),
                ip_address: Some("10.0.0.5".to_string()),
            })
            .expect("register");
        (coordinator, clock)
    }

    fn submit(client_id: &str, command: &str, params: Option<Value>) -> SubmitCommand {
        SubmitCommand {
            client_id: client_id.to_string(),
            command: command.to_string(),
            params,
            timeout_secs: None,
        }
    }

    #[test]
    fn invalid_submissions_never_reach_the_store() {
        let (coordinator, _) = coordinator();
        let cases = [
            submit("c1", "   ", None),
            submit("", "echo hi", None),
            submit("c1", "echo hi", Some(json!([1, 2, 3]))),
            submit("c1", "echo hi", Some(json!("flat"))),
            SubmitCommand {
                timeout_secs: Some(0),
                ..submit("c1", "echo hi", None)
            },
        ];
        for case in cases {
            let err = coordinator.submit_command(case).expect_err("invalid");
            assert!(matches!(err, RelayError::Validation(_)), "{err}");
        }
        assert!(coordinator
            .list_commands(CommandFilter::default())
            .expect("list")
            .is_empty());
    }

    #[test]
    fn unknown_client_submission_is_rejected() {
        let (coordinator, _) = coordinator();
        let err = coordinator
            .submit_command(submit("ghost", "echo hi", None))
            .expect_err("ghost");
        assert_eq!(err, RelayError::UnknownClient("ghost".to_string()));
    }

    #[test]
    fn null_params_become_empty_object() {
        let (coordinator, _) = coordinator();
        let created = coordinator
            .submit_command(submit("c1", "  echo hi  ", Some(Value::Null)))
            .expect("submit");
        assert_eq!(created.params, json!({}));
        assert_eq!(created.command, "echo hi");
    }

    #[test]
    fn round_trip_through_boundary() {
        let (coordinator, clock) = coordinator();
        let created = coordinator
            .submit_command(submit("c1", "echo hi", Some(json!({}))))
            .expect("submit");
        clock.advance(Duration::from_secs(1));
        coordinator.claim(&created.command_id, "c1").expect("claim");
        clock.advance(Duration::from_secs(1));
        coordinator
            .report(
                &created.command_id,
                Some("c1"),
                CommandReport::completed(0).with_stdout("hi"),
            )
            .expect("report");

        let stored = coordinator.get_command(&created.command_id).expect("get");
        assert_eq!(stored.status, CommandStatus::Completed);
        assert_eq!(stored.exit_code, Some(0));
        assert_eq!(stored.stdout.as_deref(), Some("hi"));
        assert!(stored.updated_at_ms > stored.created_at_ms);
    }

    #[test]
    fn list_commands_applies_default_and_max_limits() {
        let (coordinator, clock) = coordinator();
        for n in 0..60 {
            coordinator
                .submit_command(submit("c1", &format!("job {n}"), None))
                .expect("submit");
            clock.advance(Duration::from_millis(10));
        }
        let listed = coordinator
            .list_commands(CommandFilter::default())
            .expect("list");
        assert_eq!(listed.len(), DEFAULT_LIST_LIMIT);
        assert_eq!(listed[0].command, "job 59");

        let all = coordinator
            .list_commands(CommandFilter::default().with_limit(10_000))
            .expect("list");
        assert_eq!(all.len(), 60);

        let pending = coordinator
            .list_commands(CommandFilter::for_client("c1").with_status(CommandStatus::Running))
            .expect("list");
        assert!(pending.is_empty());

        assert!(coordinator
            .list_commands(CommandFilter::default().with_limit(0))
            .is_err());
    }

    #[test]
    fn submit_accepts_timeout_alias() {
        let request: SubmitCommand = serde_json::from_value(json!({
            "client_id": "c1",
            "command": "sleep 5",
            "timeout": 10
        }))
        .expect("decode");
        assert_eq!(request.timeout_secs, Some(10));
    }
}
