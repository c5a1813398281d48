//! Weather station history backfill
//!
//! Pulls readings from the Ambient Weather REST API into an embedded
//! database, pacing all requests through one shared rate limited client.

pub mod backfill;
pub mod client;
pub mod config;
pub mod database;
pub mod errors;
pub mod fetcher;
pub mod models;
pub mod poller;
