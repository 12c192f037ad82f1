use crate::clock::duration_ms;
use crate::commands::CommandStore;
use crate::error::{RelayError, RelayResult};
use crate::model::{
    Command, CommandFilter, CommandReport, CommandStatus, Transition, CANCELLED_REASON,
};
use crate::notifier::EventKind;
use crate::registry::ClientRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_PENDING_DEADLINE: Duration = Duration::from_secs(120);
pub const DEFAULT_RUNNING_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    /// How long a command may wait unclaimed.
    pub pending: Duration,
    /// How long a claimed command may run without a report, unless the
    /// command carries its own `timeout_secs`.
    pub running: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            pending: DEFAULT_PENDING_DEADLINE,
            running: DEFAULT_RUNNING_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: Vec<String>,
    pub lost_races: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The command was still pending and is now `failed`.
    Cancelled(Command),
    /// The command is already running; the request was only announced to
    /// observers and the record is unchanged.
    Advisory(Command),
}

/// Drives commands through the state machine.
///
/// Every status change goes through [`CommandStore::compare_and_transition`];
/// there is no other lock. Two callers racing for the same edge get one
/// success and one `Conflict`.
pub struct Dispatcher {
    commands: Arc<CommandStore>,
    registry: Arc<ClientRegistry>,
    deadlines: Deadlines,
}

impl Dispatcher {
    pub fn new(
        commands: Arc<CommandStore>,
        registry: Arc<ClientRegistry>,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            commands,
            registry,
            deadlines,
        }
    }

    pub fn deadlines(&self) -> Deadlines {
        self.deadlines
    }

    pub fn claim(&self, command_id: &str, client_id: &str) -> RelayResult<Command> {
        let command = self.commands.get(command_id)?;
        if command.client_id != client_id {
            return Err(RelayError::validation(format!(
                "command {command_id} targets client {}, not {client_id}",
                command.client_id
            )));
        }

        let now_ms = self.commands.now_ms();
        let claimed = self
            .commands
            .compare_and_transition(
                command_id,
                CommandStatus::Pending,
                Transition::claim(client_id, now_ms),
            )
            .map_err(|err| {
                if err.is_conflict() {
                    debug!(event = "claim_conflict", command_id = command_id, client_id = client_id);
                }
                err
            })?;

        self.touch_client(client_id, None);
        info!(event = "command_claimed", command_id = command_id, client_id = client_id);
        Ok(claimed)
    }

    /// Claims every pending command for `client_id`, oldest first.
    pub fn poll(&self, client_id: &str) -> RelayResult<Vec<Command>> {
        self.registry.touch(client_id, None)?;

        let mut pending = self.commands.list(
            &CommandFilter::for_client(client_id).with_status(CommandStatus::Pending),
        )?;
        pending.reverse();

        let mut claimed = Vec::with_capacity(pending.len());
        for command in pending {
            let now_ms = self.commands.now_ms();
            match self.commands.compare_and_transition(
                &command.command_id,
                CommandStatus::Pending,
                Transition::claim(client_id, now_ms),
            ) {
                Ok(command) => claimed.push(command),
                Err(err) if err.is_conflict() => {
                    debug!(event = "poll_skip", command_id = %command.command_id, error = %err);
                }
                Err(err) if claimed.is_empty() => return Err(err),
                Err(err) => {
                    // Already-claimed commands are in flight; hand them out.
                    warn!(event = "poll_partial", client_id = client_id, error = %err);
                    break;
                }
            }
        }

        if !claimed.is_empty() {
            info!(event = "commands_polled", client_id = client_id, count = claimed.len());
        }
        Ok(claimed)
    }

    pub fn report(
        &self,
        command_id: &str,
        reporter: Option<&str>,
        report: CommandReport,
    ) -> RelayResult<Command> {
        let command = self.commands.get(command_id)?;
        if let Some(reporter) = reporter {
            if reporter != command.client_id {
                return Err(RelayError::validation(format!(
                    "command {command_id} belongs to client {}, not {reporter}",
                    command.client_id
                )));
            }
        }

        let outcome = report.outcome;
        let now_ms = self.commands.now_ms();
        let finished = self
            .commands
            .compare_and_transition(
                command_id,
                CommandStatus::Running,
                Transition::report(report, now_ms),
            )
            .map_err(|err| {
                if let RelayError::Conflict { actual, .. } = &err {
                    warn!(
                        event = "late_report",
                        command_id = command_id,
                        status = %actual,
                        outcome = ?outcome
                    );
                }
                err
            })?;

        self.touch_client(&finished.client_id, Some(command_id));
        info!(
            event = "command_reported",
            command_id = command_id,
            client_id = %finished.client_id,
            status = %finished.status,
            exit_code = ?finished.exit_code
        );
        Ok(finished)
    }

    /// Operator cancellation. Only a pending command can actually be stopped;
    /// once running the relay has no way to abort the client side.
    pub fn cancel(&self, command_id: &str, reason: Option<&str>) -> RelayResult<CancelOutcome> {
        let command = self.commands.get(command_id)?;
        if command.status != CommandStatus::Pending {
            return self.cancel_in_flight(command);
        }

        let reason = reason
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(CANCELLED_REASON);
        let now_ms = self.commands.now_ms();
        match self.commands.compare_and_transition(
            command_id,
            CommandStatus::Pending,
            Transition::cancel(reason, now_ms),
        ) {
            Ok(cancelled) => {
                info!(event = "command_cancelled", command_id = command_id);
                Ok(CancelOutcome::Cancelled(cancelled))
            }
            Err(err) if err.is_conflict() => {
                let current = self.commands.get(command_id)?;
                self.cancel_in_flight(current)
            }
            Err(err) => Err(err),
        }
    }

    fn cancel_in_flight(&self, command: Command) -> RelayResult<CancelOutcome> {
        if command.status != CommandStatus::Running {
            return Err(RelayError::Conflict {
                command_id: command.command_id,
                expected: CommandStatus::Pending,
                actual: command.status,
            });
        }
        self.commands.notifier().publish(
            self.commands.now_ms(),
            EventKind::CancelRequested {
                command_id: command.command_id.clone(),
                client_id: command.client_id.clone(),
            },
        );
        info!(
            event = "cancel_advisory",
            command_id = %command.command_id,
            client_id = %command.client_id
        );
        Ok(CancelOutcome::Advisory(command))
    }

    /// Forces stale commands into `timeout`.
    ///
    /// Safe to run concurrently with itself and with claims/reports: each
    /// expiry is a compare-and-transition, so a command already moved by
    /// someone else is counted as a lost race and left alone.
    pub fn reclaim_timeouts(
        &self,
        now_ms: i64,
        pending_deadline: Duration,
        running_deadline: Duration,
    ) -> RelayResult<SweepReport> {
        let mut report = SweepReport::default();

        let pending_ms = duration_ms(pending_deadline);
        for command in self
            .commands
            .list(&CommandFilter::in_status(CommandStatus::Pending))?
        {
            if now_ms.saturating_sub(command.created_at_ms) > pending_ms {
                self.expire(&command, CommandStatus::Pending, now_ms, &mut report)?;
            }
        }

        for command in self
            .commands
            .list(&CommandFilter::in_status(CommandStatus::Running))?
        {
            let started_ms = command.claimed_at_ms.unwrap_or(command.updated_at_ms);
            let deadline_ms = duration_ms(command.running_deadline(running_deadline));
            if now_ms.saturating_sub(started_ms) > deadline_ms {
                self.expire(&command, CommandStatus::Running, now_ms, &mut report)?;
            }
        }

        if !report.timed_out.is_empty() || report.lost_races > 0 {
            info!(
                event = "sweep_done",
                timed_out = report.timed_out.len(),
                lost_races = report.lost_races
            );
        }
        Ok(report)
    }

    /// `reclaim_timeouts` at the current time with the configured deadlines.
    pub fn sweep(&self) -> RelayResult<SweepReport> {
        self.reclaim_timeouts(
            self.commands.now_ms(),
            self.deadlines.pending,
            self.deadlines.running,
        )
    }

    fn expire(
        &self,
        command: &Command,
        expected: CommandStatus,
        now_ms: i64,
        report: &mut SweepReport,
    ) -> RelayResult<()> {
        match self.commands.compare_and_transition(
            &command.command_id,
            expected,
            Transition::timeout(now_ms),
        ) {
            Ok(_) => {
                info!(
                    event = "command_timed_out",
                    command_id = %command.command_id,
                    client_id = %command.client_id,
                    from = %expected
                );
                report.timed_out.push(command.command_id.clone());
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                debug!(event = "sweep_conflict", command_id = %command.command_id);
                report.lost_races += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn touch_client(&self, client_id: &str, last_command_id: Option<&str>) {
        if let Err(err) = self.registry.touch(client_id, last_command_id) {
            warn!(event = "client_touch_failed", client_id = client_id, error = %err);
        }
    }
}
