//! Infrastructure layer: stores, handler dispatch, retry cycles, scheduling, config.

pub mod audit;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod processor;
pub mod retry;
pub mod schedule;
pub mod store;

mod integration_tests;
