use crate::clock::Clock;
use crate::error::{RelayError, RelayResult};
use crate::model::{Command, CommandFilter, CommandStatus, Transition};
use crate::notifier::{EventKind, EventNotifier};
use crate::store::RelayStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Durable record of every command, with the single status write path.
pub struct CommandStore {
    store: Arc<dyn RelayStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<EventNotifier>,
}

impl CommandStore {
    pub fn new(
        store: Arc<dyn RelayStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<EventNotifier>,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
        }
    }

    /// Creates a `pending` command for a registered client.
    pub fn create(
        &self,
        client_id: &str,
        command: &str,
        params: Value,
        timeout_secs: Option<u64>,
    ) -> RelayResult<Command> {
        if self.store.get_client(client_id)?.is_none() {
            return Err(RelayError::UnknownClient(client_id.to_string()));
        }
        let now_ms = self.clock.now_ms();
        let created = Command::new(client_id, command, params, timeout_secs, now_ms);
        self.store.insert_command(&created)?;

        self.notifier.publish(
            now_ms,
            EventKind::CommandCreated {
                command_id: created.command_id.clone(),
                client_id: created.client_id.clone(),
            },
        );
        info!(
            event = "command_created",
            command_id = %created.command_id,
            client_id = %created.client_id
        );
        Ok(created)
    }

    pub fn get(&self, command_id: &str) -> RelayResult<Command> {
        self.store
            .get_command(command_id)?
            .ok_or_else(|| RelayError::command_not_found(command_id))
    }

    pub fn list(&self, filter: &CommandFilter) -> RelayResult<Vec<Command>> {
        self.store.list_commands(filter)
    }

    /// Atomically moves a command from `expected` to `transition.to`.
    ///
    /// Publishes exactly one event per successful transition. A lost race
    /// comes back as `Conflict` and publishes nothing.
    pub fn compare_and_transition(
        &self,
        command_id: &str,
        expected: CommandStatus,
        transition: Transition,
    ) -> RelayResult<Command> {
        let to = transition.to;
        let updated = self
            .store
            .compare_and_transition(command_id, expected, transition)?;
        self.notifier.publish(
            updated.updated_at_ms,
            EventKind::CommandTransitioned {
                command_id: updated.command_id.clone(),
                client_id: updated.client_id.clone(),
                from: expected,
                to,
            },
        );
        Ok(updated)
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }
}
