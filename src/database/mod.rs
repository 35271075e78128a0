pub mod connection;
pub mod schema;
pub mod store;

pub use store::{LocalStore, QueueCounts};
