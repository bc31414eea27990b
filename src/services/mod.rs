//! Services layer: shared team state and coordination primitives.

pub mod conflict;
pub mod events;
pub mod mailbox;
pub mod merge_queue;
pub mod scheduler;
pub mod task_store;

pub use conflict::{ConflictNegotiator, Resolution, TaskIntent};
pub use events::{EventBus, SequencedEvent, TeamEvent};
pub use mailbox::MessageBus;
pub use merge_queue::{MergeJob, MergeManager, MergeOutcome, OverlapWarning};
pub use scheduler::ModelScheduler;
pub use task_store::{TaskStore, TaskStoreConfig};
