use relay_core::{Coordinator, SweepReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Periodically times out stale commands until `shutdown` flips to `true`.
///
/// A failed sweep is logged and the next tick simply tries again; every
/// expiry is its own compare-and-transition, so nothing is left half-done.
pub fn spawn_timeout_sweeper(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(event = "sweeper_start", interval_secs = interval.as_secs());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_once(&coordinator).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(event = "sweeper_stop");
    })
}

pub async fn sweep_once(coordinator: &Arc<Coordinator>) -> Option<SweepReport> {
    let coordinator = coordinator.clone();
    match tokio::task::spawn_blocking(move || coordinator.sweep()).await {
        Ok(Ok(report)) => {
            debug!(
                event = "sweep_tick",
                timed_out = report.timed_out.len(),
                lost_races = report.lost_races
            );
            Some(report)
        }
        Ok(Err(err)) => {
            warn!(event = "sweep_failed", error = %err);
            None
        }
        Err(err) => {
            error!(event = "sweep_task_failed", error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{
        ClientRecord, Command, CommandFilter, CommandStatus, CoordinatorConfig, ManualClock,
        MemoryStore, RelayError, RelayResult, RelayStore, Registration, SubmitCommand, Transition,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose listings can be switched off to simulate an outage.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl RelayStore for FlakyStore {
        fn upsert_client(&self, record: ClientRecord) -> RelayResult<ClientRecord> {
            self.inner.upsert_client(record)
        }

        fn touch_client(
            &self,
            client_id: &str,
            seen_at_ms: i64,
            last_command_id: Option<&str>,
        ) -> RelayResult<ClientRecord> {
            self.inner.touch_client(client_id, seen_at_ms, last_command_id)
        }

        fn get_client(&self, client_id: &str) -> RelayResult<Option<ClientRecord>> {
            self.inner.get_client(client_id)
        }

        fn list_clients(&self) -> RelayResult<Vec<ClientRecord>> {
            self.inner.list_clients()
        }

        fn insert_command(&self, command: &Command) -> RelayResult<()> {
            self.inner.insert_command(command)
        }

        fn get_command(&self, command_id: &str) -> RelayResult<Option<Command>> {
            self.inner.get_command(command_id)
        }

        fn list_commands(&self, filter: &CommandFilter) -> RelayResult<Vec<Command>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(RelayError::Store("database is locked".to_string()));
            }
            self.inner.list_commands(filter)
        }

        fn compare_and_transition(
            &self,
            command_id: &str,
            expected: CommandStatus,
            transition: Transition,
        ) -> RelayResult<Command> {
            self.inner
                .compare_and_transition(command_id, expected, transition)
        }
    }

    fn relay(store: Arc<dyn RelayStore>) -> (Arc<Coordinator>, Arc<ManualClock>, String) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let coordinator = Arc::new(Coordinator::new(
            store,
            clock.clone(),
            CoordinatorConfig::default(),
        ));
        coordinator
            .register_client(Registration {
                client_id: Some("c1".to_string()),
                client_type: "linux".to_string(),
                ..Registration::default()
            })
            .expect("register");
        let created = coordinator
            .submit_command(SubmitCommand {
                client_id: "c1".to_string(),
                command: "echo hi".to_string(),
                params: Some(json!({})),
                timeout_secs: None,
            })
            .expect("submit");
        (coordinator, clock, created.command_id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweep_once_times_out_overdue_work() {
        let (coordinator, clock, command_id) = relay(Arc::new(MemoryStore::new()));
        clock.advance(Duration::from_secs(121));

        let report = sweep_once(&coordinator).await.expect("report");
        assert_eq!(report.timed_out, vec![command_id.clone()]);
        assert_eq!(
            coordinator.get_command(&command_id).expect("get").status,
            CommandStatus::Timeout
        );

        let again = sweep_once(&coordinator).await.expect("report");
        assert!(again.timed_out.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_sweep_recovers_on_next_tick() {
        let store = Arc::new(FlakyStore::default());
        let (coordinator, clock, command_id) = relay(store.clone());
        clock.advance(Duration::from_secs(121));

        store.down.store(true, Ordering::SeqCst);
        assert!(sweep_once(&coordinator).await.is_none());
        assert_eq!(
            coordinator.get_command(&command_id).expect("get").status,
            CommandStatus::Pending
        );

        store.down.store(false, Ordering::SeqCst);
        let report = sweep_once(&coordinator).await.expect("report");
        assert_eq!(report.timed_out, vec![command_id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_sweeper_runs_and_stops() {
        let (coordinator, clock, command_id) = relay(Arc::new(MemoryStore::new()));
        clock.advance(Duration::from_secs(121));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            spawn_timeout_sweeper(coordinator.clone(), Duration::from_millis(20), shutdown_rx);

        let mut status = CommandStatus::Pending;
        for _ in 0..100 {
            status = coordinator.get_command(&command_id).expect("get").status;
            if status == CommandStatus::Timeout {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, CommandStatus::Timeout);

        shutdown_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper stops")
            .expect("join");
    }
}
