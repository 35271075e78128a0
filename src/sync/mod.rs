pub mod engine;
pub mod events;
pub mod trigger;

pub use engine::{CycleOutcome, SyncEngine};
pub use events::{CycleReport, EventBus, SyncEvent, TriggerReason};
pub use trigger::{RetryBackoff, TriggerHandle, TriggerPolicy};
