//! Coordinator core for the command relay.
//!
//! Clients register and heartbeat into the [`ClientRegistry`]; operators
//! submit commands through the [`Coordinator`]; the [`Dispatcher`] moves each
//! command through `pending -> running -> completed | failed`, or into
//! `timeout` when nobody claims or reports it in time. Every status change is
//! a compare-and-transition on a [`RelayStore`], and every successful change
//! is published on the [`EventNotifier`].

pub mod clock;
pub mod commands;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod notifier;
pub mod registry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use commands::CommandStore;
pub use coordinator::{Coordinator, CoordinatorConfig, SubmitCommand};
pub use dispatcher::{CancelOutcome, Deadlines, Dispatcher, SweepReport};
pub use error::{EntityKind, RelayError, RelayResult};
pub use model::{
    Client, ClientRecord, ClientStatus, Command, CommandFilter, CommandReport, CommandStatus,
    CommandSummary, ReportOutcome, Transition,
};
pub use notifier::{EventKind, EventNotifier, RelayEvent, Subscription};
pub use registry::{ClientRegistry, Registration};
pub use store::{MemoryStore, RelayStore};
