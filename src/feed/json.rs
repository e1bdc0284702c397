use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::provider::FixtureSource;
use crate::models::{Fixture, MatchRecord};

/// Fixture source backed by JSON files on disk: an array of fixtures and an
/// optional array of settled matches.
pub struct JsonFileSource {
    fixtures: PathBuf,
    history: Option<PathBuf>,
}

impl JsonFileSource {
    pub fn new(fixtures: impl Into<PathBuf>, history: Option<PathBuf>) -> Self {
        JsonFileSource {
            fixtures: fixtures.into(),
            history,
        }
    }
}

async fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let items: Vec<T> =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
    debug!("Loaded {} record(s) from {}", items.len(), path.display());
    Ok(items)
}

#[async_trait]
impl FixtureSource for JsonFileSource {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn fetch_fixtures(&self) -> Result<Vec<Fixture>> {
        read_array(&self.fixtures).await
    }

    async fn fetch_results(&self) -> Result<Vec<MatchRecord>> {
        match &self.history {
            Some(path) => read_array(path).await,
            None => Ok(Vec::new()),
        }
    }
}
