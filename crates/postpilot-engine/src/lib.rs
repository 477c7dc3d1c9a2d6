//! # PostPilot Engine
//!
//! The scheduled publication core: the task state machine
//! (pending → published/failed/cancelled), the pure recurrence
//! calculator that regenerates recurring posts, sqlite persistence
//! with atomic claiming, and the interval poller that discovers due
//! tasks and dispatches them with bounded concurrency.
//!
//! ## Flow
//! ```text
//! Poller (tokio interval)
//!   ├── claim due tasks (atomic pending → in-flight)
//!   └── per task, semaphore-gated:
//!         TaskEngine::process_due
//!           ├── CredentialManager::get_valid
//!           ├── Dispatcher::publish (retry/backoff inside)
//!           └── Published / Failed / retry-later
//!                 └── recurring + published → successor task
//! ```

pub mod machine;
pub mod persistence;
pub mod poller;
pub mod recurrence;
pub mod tasks;

pub use machine::{NewTask, TaskEngine};
pub use persistence::TaskDb;
pub use poller::{run_pass, spawn_poller};
pub use recurrence::next_occurrence;
pub use tasks::{Recurrence, RecurrencePattern, ScheduledTask, TaskStatus};
