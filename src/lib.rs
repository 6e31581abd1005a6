pub mod api;
pub mod config;
pub mod engine;
pub mod holds;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod wal;
