pub mod access;
pub mod config;
pub mod cursor;
pub mod error;
pub mod message;
pub mod paths;
pub mod project;
pub mod registry;
pub mod store;
pub mod target;

pub use error::MailError;
