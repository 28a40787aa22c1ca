//! Synchronization core between the property-management portal (the
//! authoritative REST backend) and the local SQLite mirror. Every business
//! write goes to the portal first and is mirrored locally second; work that
//! cannot complete is parked on a durable queue and replayed by the drainer.

pub mod auth;
pub mod config;
pub mod db;
pub mod drain;
pub mod error;
pub mod model;
pub mod portal;
pub mod session;
pub mod status;
pub mod sync;
