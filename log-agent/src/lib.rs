pub mod config;
pub mod identity;
pub mod manager;
pub mod metrics;
pub mod offset_store;
pub mod runner;
pub mod sink;
pub mod tail_reader;
pub mod tail_task;
pub mod watcher;
