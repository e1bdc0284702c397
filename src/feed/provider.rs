use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Fixture, MatchRecord};

/// Trait that every odds/results source must implement.
#[async_trait]
pub trait FixtureSource: Send + Sync {
    /// Upcoming fixtures with their latest quoted prices.
    async fn fetch_fixtures(&self) -> Result<Vec<Fixture>>;

    /// Settled matches used to fit the models. Empty when the source has none.
    async fn fetch_results(&self) -> Result<Vec<MatchRecord>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
