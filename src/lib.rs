pub mod auth;
pub mod calendar;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod forms;
pub mod limits;
pub mod mail;
pub mod model;
pub mod notify;
pub mod observability;
pub mod session;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
pub mod workflow;
