//! Offline-first attendance capture with a durable local queue that is
//! drained to the attendance server whenever connectivity allows.

pub mod config;
pub mod connectivity;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod remote;
pub mod sync;
pub mod ui;
