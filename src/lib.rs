pub mod auth;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod observability;
pub mod sql;
pub mod study;
pub mod tls;
pub mod wal;
pub mod wire;
