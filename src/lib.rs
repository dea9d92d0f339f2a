pub mod agent;
pub mod commands;
pub mod config;
pub mod heartbeat;
pub mod mqtt;
pub mod session;
pub mod shell;
/// Transport traits the session manager is written against.
pub mod transport;
