pub mod app;
pub mod backfill;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fsutil;
pub mod gateway;
pub mod ingestion;
pub mod pbx;
pub mod pipeline;
pub mod queue;
pub mod roster;
