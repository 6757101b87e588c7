pub mod config;
pub mod connection;
pub mod ds;
pub mod error;
pub mod message_broker;
pub mod protocol;
pub mod server;
