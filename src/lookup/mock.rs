//! In-memory lookup for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{LookupError, ProteinLookup, ProteinRecord, ProteinSummary, SearchQuery};

/// Lookup backed by fixed tables; records every search it receives.
#[derive(Clone, Default)]
pub struct StaticLookup {
    records: HashMap<String, ProteinRecord>,
    results: Vec<ProteinSummary>,
    searches: Arc<Mutex<Vec<SearchQuery>>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `record` under `identifier` (matched case-insensitively).
    pub fn with_record(mut self, identifier: &str, record: ProteinRecord) -> Self {
        self.records.insert(identifier.to_uppercase(), record);
        self
    }

    pub fn with_results(mut self, results: Vec<ProteinSummary>) -> Self {
        self.results = results;
        self
    }

    pub fn searches(&self) -> Vec<SearchQuery> {
        self.searches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProteinLookup for StaticLookup {
    async fn fetch_by_id(&self, identifier: &str) -> Result<Option<ProteinRecord>, LookupError> {
        Ok(self.records.get(&identifier.trim().to_uppercase()).cloned())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProteinSummary>, LookupError> {
        if query.query.trim().is_empty() {
            return Err(LookupError::EmptyQuery);
        }
        self.searches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.clone());
        Ok(self
            .results
            .iter()
            .take(query.limit as usize)
            .cloned()
            .collect())
    }
}
