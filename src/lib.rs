pub mod agent;
pub mod auth;
pub mod chat;
pub mod checkpoint;
pub mod conf;
pub mod data;
pub mod docs;
pub mod jwt;
pub mod server;
pub mod tracing;
pub mod types;
