//! Personal job-search tracker.
//!
//! Companies, multi-stage application tasks and reusable self-introduction
//! texts, persisted in a document [`store`] and always scoped to one owner.
//! The interesting parts are the operators that touch several records at
//! once: [`Tracker::delete_company_cascade`] and [`Tracker::progress_task`],
//! both committed through the store's atomic batch.

pub mod cascade;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod progress;
pub mod repo;
pub mod sanitize;
pub mod store;
pub mod tracker;
pub mod views;
pub mod watch;

pub use cascade::CascadeReport;
pub use error::{Error, Result};
pub use progress::Progression;
pub use repo::{Entity, Repository, Snapshots};
pub use store::{MemoryStore, Store};
pub use tracker::Tracker;
