//! Favorited-product change detection and notification fan-out.
//!
//! Batches of product snapshots arrive on a bus, are diffed against the
//! change store, and price drops are fanned out to every favoriting user
//! through the notification gateway.

pub mod bus;
pub mod config;
pub mod db;
pub mod gateway;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod snapshot;
