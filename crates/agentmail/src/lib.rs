pub mod client;
pub mod config_store;
pub mod daemon;
pub mod ipc;
pub mod proto;
pub mod runtime_store;
pub mod transport;
pub mod watcher;
