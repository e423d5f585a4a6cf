//! The durable pipeline orchestrator: storage, state machine, run driver,
//! approval gate, task dispatch and the HTTP surface over them.

pub mod api;
pub mod db;
pub mod dispatch;
pub mod driver;
pub mod gates;
pub mod models;
pub mod server;
pub mod state;
