// Gomoku arena backend: submission intake, compile and judge task
// dispatch, match reconciliation, Elo settlement, and matchmaking.

pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod elo;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod mq;
pub mod queue;
pub mod scheduler;
pub mod scoreboard;
pub mod submission;

pub use config::Config;
pub use db::Database;
pub use engine::Arena;
pub use error::{Error, Result};
