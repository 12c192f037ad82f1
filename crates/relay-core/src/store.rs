use crate::error::{RelayError, RelayResult};
use crate::model::{ClientRecord, Command, CommandFilter, CommandStatus, Transition};
use std::collections::HashMap;
use std::sync::RwLock;

/// Persistence contract shared by every backend.
///
/// `compare_and_transition` is the only way to change a command's status and
/// must be atomic with respect to every other caller of the same store,
/// including other processes sharing the backing storage.
pub trait RelayStore: Send + Sync {
    /// Inserts the client or merges it into the stored record
    /// (see [`ClientRecord::merge`]). Returns the stored result.
    fn upsert_client(&self, record: ClientRecord) -> RelayResult<ClientRecord>;

    /// Records that the client was seen. Fails with `NotFound` for unknown ids.
    fn touch_client(
        &self,
        client_id: &str,
        seen_at_ms: i64,
        last_command_id: Option<&str>,
    ) -> RelayResult<ClientRecord>;

    fn get_client(&self, client_id: &str) -> RelayResult<Option<ClientRecord>>;

    fn list_clients(&self) -> RelayResult<Vec<ClientRecord>>;

    fn insert_command(&self, command: &Command) -> RelayResult<()>;

    fn get_command(&self, command_id: &str) -> RelayResult<Option<Command>>;

    /// Commands matching `filter`, newest first by `created_at_ms`, ties
    /// broken by most recent insertion.
    fn list_commands(&self, filter: &CommandFilter) -> RelayResult<Vec<Command>>;

    fn compare_and_transition(
        &self,
        command_id: &str,
        expected: CommandStatus,
        transition: Transition,
    ) -> RelayResult<Command>;
}

#[derive(Default)]
struct CommandTable {
    next_seq: u64,
    rows: HashMap<String, (u64, Command)>,
}

/// Process-local store used by tests and `--database :memory:` runs.
#[derive(Default)]
pub struct MemoryStore {
    clients: RwLock<HashMap<String, ClientRecord>>,
    commands: RwLock<CommandTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> RelayError {
    RelayError::Store("memory store lock poisoned".to_string())
}

impl RelayStore for MemoryStore {
    fn upsert_client(&self, record: ClientRecord) -> RelayResult<ClientRecord> {
        let mut clients = self.clients.write().map_err(poisoned)?;
        let stored = match clients.remove(&record.client_id) {
            Some(existing) => existing.merge(record),
            None => record,
        };
        clients.insert(stored.client_id.clone(), stored.clone());
        Ok(stored)
    }

    fn touch_client(
        &self,
        client_id: &str,
        seen_at_ms: i64,
        last_command_id: Option<&str>,
    ) -> RelayResult<ClientRecord> {
        let mut clients = self.clients.write().map_err(poisoned)?;
        let record = clients
            .get_mut(client_id)
            .ok_or_else(|| RelayError::client_not_found(client_id))?;
        record.observe(seen_at_ms, last_command_id);
        Ok(record.clone())
    }

    fn get_client(&self, client_id: &str) -> RelayResult<Option<ClientRecord>> {
        let clients = self.clients.read().map_err(poisoned)?;
        Ok(clients.get(client_id).cloned())
    }

    fn list_clients(&self) -> RelayResult<Vec<ClientRecord>> {
        let clients = self.clients.read().map_err(poisoned)?;
        let mut records: Vec<_> = clients.values().cloned().collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(records)
    }

    fn insert_command(&self, command: &Command) -> RelayResult<()> {
        let mut table = self.commands.write().map_err(poisoned)?;
        if table.rows.contains_key(&command.command_id) {
            return Err(RelayError::Store(format!(
                "duplicate command id {}",
                command.command_id
            )));
        }
        table.next_seq += 1;
        let seq = table.next_seq;
        table
            .rows
            .insert(command.command_id.clone(), (seq, command.clone()));
        Ok(())
    }

    fn get_command(&self, command_id: &str) -> RelayResult<Option<Command>> {
        let table = self.commands.read().map_err(poisoned)?;
        Ok(table.rows.get(command_id).map(|(_, command)| command.clone()))
    }

    fn list_commands(&self, filter: &CommandFilter) -> RelayResult<Vec<Command>> {
        let table = self.commands.read().map_err(poisoned)?;
        let mut matched: Vec<_> = table
            .rows
            .values()
            .filter(|(_, command)| filter.matches(command))
            .collect();
        matched.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| seq_b.cmp(seq_a))
        });
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|(_, command)| command.clone())
            .collect())
    }

    fn compare_and_transition(
        &self,
        command_id: &str,
        expected: CommandStatus,
        transition: Transition,
    ) -> RelayResult<Command> {
        let mut table = self.commands.write().map_err(poisoned)?;
        let (_, stored) = table
            .rows
            .get_mut(command_id)
            .ok_or_else(|| RelayError::command_not_found(command_id))?;
        // Work on a copy so a rejected transition leaves the row untouched.
        let mut next = stored.clone();
        next.apply_transition(expected, transition)?;
        *stored = next.clone();
        Ok(next)
    }
}
