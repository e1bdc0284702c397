pub mod json;
pub mod provider;

pub use json::JsonFileSource;
pub use provider::FixtureSource;
