pub mod bankroll;
pub mod devig;
pub mod engine;
pub mod express;
pub mod kelly;
pub mod movement;
pub mod value;

pub use engine::{ScanReport, ValueEngine};
