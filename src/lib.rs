//! Sports value-betting engine: probabilistic match models, margin removal,
//! value detection, multi-leg construction and a bankroll controller.

pub mod betting;
pub mod config;
pub mod db;
pub mod feed;
pub mod models;
pub mod predict;

pub use betting::{ScanReport, ValueEngine};
pub use config::{Config, EngineSettings};
