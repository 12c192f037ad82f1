use crate::clock::Clock;
use crate::error::{RelayError, RelayResult};
use crate::model::{Client, ClientRecord, DEFAULT_HOSTNAME};
use crate::notifier::{EventKind, EventNotifier};
use crate::store::RelayStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Self-description a client agent sends when it (re)connects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    #[serde(default)]
    pub client_id: Option<String>,
    pub client_type: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Known clients and their liveness.
///
/// Status is computed from `last_seen` on every read; nothing in the relay
/// ever writes "inactive" back to the store.
pub struct ClientRegistry {
    store: Arc<dyn RelayStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<EventNotifier>,
    heartbeat_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(
        store: Arc<dyn RelayStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<EventNotifier>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            heartbeat_timeout,
        }
    }

    pub fn register(&self, registration: Registration) -> RelayResult<Client> {
        let client_type = registration.client_type.trim();
        if client_type.is_empty() {
            return Err(RelayError::validation("client_type must not be empty"));
        }
        let client_id = match registration.client_id.as_deref().map(str::trim) {
            Some("") => return Err(RelayError::validation("client_id must not be blank")),
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let hostname = registration
            .hostname
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_HOSTNAME);

        let now_ms = self.clock.now_ms();
        let stored = self.store.upsert_client(ClientRecord {
            client_id: client_id.clone(),
            hostname: hostname.to_string(),
            client_type: client_type.to_string(),
            ip_address: registration.ip_address,
            last_seen_ms: now_ms,
            last_command_id: None,
            registered_at_ms: now_ms,
        })?;

        self.notifier
            .publish(now_ms, EventKind::ClientRegistered { client_id });
        info!(
            event = "client_registered",
            client_id = %stored.client_id,
            hostname = %stored.hostname,
            client_type = %stored.client_type
        );
        Ok(stored.to_client(now_ms, self.heartbeat_timeout))
    }

    pub fn heartbeat(&self, client_id: &str, last_command_id: Option<&str>) -> RelayResult<Client> {
        let record = self.touch(client_id, last_command_id)?;
        debug!(event = "client_heartbeat", client_id = client_id);
        Ok(record)
    }

    /// Marks the client as seen now; used by every client-originated call.
    pub fn touch(&self, client_id: &str, last_command_id: Option<&str>) -> RelayResult<Client> {
        let now_ms = self.clock.now_ms();
        let record = self.store.touch_client(client_id, now_ms, last_command_id)?;
        Ok(record.to_client(now_ms, self.heartbeat_timeout))
    }

    pub fn get(&self, client_id: &str) -> RelayResult<Client> {
        let now_ms = self.clock.now_ms();
        self.store
            .get_client(client_id)?
            .map(|record| record.to_client(now_ms, self.heartbeat_timeout))
            .ok_or_else(|| RelayError::client_not_found(client_id))
    }

    pub fn contains(&self, client_id: &str) -> RelayResult<bool> {
        Ok(self.store.get_client(client_id)?.is_some())
    }

    pub fn list(&self) -> RelayResult<Vec<Client>> {
        let now_ms = self.clock.now_ms();
        Ok(self
            .store
            .list_clients()?
            .iter()
            .map(|record| record.to_client(now_ms, self.heartbeat_timeout))
            .collect())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::ClientStatus;
    use crate::store::MemoryStore;

    fn registry() -> (ClientRegistry, Arc<ManualClock>, Arc<EventNotifier>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let notifier = Arc::new(EventNotifier::new(16));
        let registry = ClientRegistry::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            notifier.clone(),
            Duration::from_secs(60),
        );
        (registry, clock, notifier)
    }

    fn registration(client_id: &str, ip: &str) -> Registration {
        Registration {
            client_id: Some(client_id.to_string()),
            client_type: "linux".to_string(),
            hostname: Some("build-01".to_string()),
            ip_address: Some(ip.to_string()),
        }
    }

    #[test]
    fn re_registration_updates_instead_of_duplicating() {
        let (registry, clock, _) = registry();
        let first = registry
            .register(registration("c1", "10.0.0.1"))
            .expect("register");
        clock.advance(Duration::from_secs(5));
        let second = registry
            .register(registration("c1", "10.0.0.2"))
            .expect("register again");

        assert_eq!(second.ip_address.as_deref(), Some("10.0.0.2"));
        assert!(second.last_seen_ms > first.last_seen_ms);
        let clients = registry.list().expect("list");
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, "c1");
    }

    #[test]
    fn register_assigns_id_and_default_hostname() {
        let (registry, _, notifier) = registry();
        let mut sub = notifier.subscribe();
        let client = registry
            .register(Registration {
                client_type: "windows".to_string(),
                ..Registration::default()
            })
            .expect("register");
        assert!(Uuid::parse_str(&client.client_id).is_ok());
        assert_eq!(client.hostname, DEFAULT_HOSTNAME);
        assert_eq!(client.status, ClientStatus::Active);
        let event = sub.try_next().expect("event");
        assert_eq!(
            event.kind,
            EventKind::ClientRegistered {
                client_id: client.client_id
            }
        );
    }

    #[test]
    fn register_rejects_missing_type() {
        let (registry, _, _) = registry();
        let err = registry
            .register(Registration {
                client_id: Some("c1".to_string()),
                client_type: "  ".to_string(),
                ..Registration::default()
            })
            .expect_err("invalid");
        assert!(matches!(err, RelayError::Validation(_)));
        assert!(registry.list().expect("list").is_empty());
    }

    #[test]
    fn heartbeat_unknown_client_is_not_found() {
        let (registry, _, _) = registry();
        let err = registry.heartbeat("ghost", None).expect_err("unknown");
        assert_eq!(err, RelayError::client_not_found("ghost"));
    }

    #[test]
    fn status_goes_inactive_without_heartbeats_and_recovers() {
        let (registry, clock, _) = registry();
        registry
            .register(registration("c1", "10.0.0.1"))
            .expect("register");

        clock.advance(Duration::from_secs(61));
        assert_eq!(registry.get("c1").expect("get").status, ClientStatus::Inactive);

        let client = registry.heartbeat("c1", Some("cmd-7")).expect("heartbeat");
        assert_eq!(client.status, ClientStatus::Active);
        assert_eq!(client.last_command_id.as_deref(), Some("cmd-7"));
    }
}
