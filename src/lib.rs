pub mod app;
pub mod cli;
pub mod config;
pub mod errors;
pub mod imap;
pub mod message;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod sync;
pub mod types;
