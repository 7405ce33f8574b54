//! Protein database lookups used by the worker's tools
//!
//! [`ProteinLookup`] is the seam: the server's tools depend on the trait,
//! production wires in [`UniProtClient`], tests use [`mock::StaticLookup`].

pub mod mock;
pub mod uniprot;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use uniprot::UniProtClient;

static VALID_AA_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[ACDEFGHIKLMNPQRSTVWY-]+$").expect("Invalid amino acid pattern")
});

static UNIPROT_ACCESSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[A-Z0-9]{6,10}(?:-\d+)?$").expect("Invalid accession pattern")
});

static UNIPROT_ENTRY_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[A-Z0-9]+_[A-Z0-9]+$").expect("Invalid entry name pattern")
});

/// Default cap on search results.
pub const DEFAULT_SEARCH_LIMIT: u32 = 10;
/// Largest number of search results a single query may ask for.
pub const MAX_SEARCH_LIMIT: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Network error contacting UniProt: {0}")]
    Http(#[from] reqwest::Error),

    #[error("UniProt API returned status {status}. Details: {details}")]
    Status { status: u16, details: String },

    #[error("Failed to parse response from UniProt: {0}")]
    Decode(String),

    #[error("Search query cannot be empty.")]
    EmptyQuery,

    #[error("Failed to create HTTP client: {0}")]
    Client(String),
}

/// Sequence record returned by an identifier lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinRecord {
    pub sequence: String,
    pub organism: String,
    /// Canonical (primary) accession
    pub id: String,
}

/// One row of a search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinSummary {
    pub id: Option<String>,
    pub entry_name: Option<String>,
    pub name: String,
    pub organism: String,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub species_filter: Option<String>,
    pub keyword_filter: Option<String>,
    pub limit: u32,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            species_filter: None,
            keyword_filter: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn species(mut self, species: impl Into<String>) -> Self {
        self.species_filter = Some(species.into());
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword_filter = Some(keyword.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit.clamp(1, MAX_SEARCH_LIMIT as i64) as u32;
        self
    }

    /// UniProt query syntax: the free text in parentheses, then optional
    /// taxonomy/organism and keyword clauses, joined with AND.
    pub fn to_query_string(&self) -> String {
        let mut parts = vec![format!("({})", self.query)];
        if let Some(species) = self.species_filter.as_deref().filter(|s| !s.is_empty()) {
            if species.chars().all(|c| c.is_ascii_digit()) {
                parts.push(format!("taxonomy_id:{species}"));
            } else {
                parts.push(format!("organism_name:\"{species}\""));
            }
        }
        if let Some(keyword) = self.keyword_filter.as_deref().filter(|k| !k.is_empty()) {
            parts.push(format!("keyword:{keyword}"));
        }
        parts.join(" AND ")
    }
}

/// External protein database.
#[async_trait]
pub trait ProteinLookup: Send + Sync {
    /// Look up one entry by accession or entry name. `Ok(None)` when the
    /// entry does not exist or carries no valid sequence.
    async fn fetch_by_id(&self, identifier: &str) -> Result<Option<ProteinRecord>, LookupError>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProteinSummary>, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    pub request_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_search_timeout")]
    pub search_timeout: Duration,
}

fn default_base_url() -> String {
    "https://rest.uniprot.org".to_string()
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_search_timeout() -> Duration {
    Duration::from_secs(45)
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_fetch_timeout(),
            search_timeout: default_search_timeout(),
        }
    }
}

/// True when `sequence` is non-empty and uses only the amino acid alphabet
/// (plus `-` for gaps), in either case.
pub fn validate_sequence(sequence: &str) -> bool {
    if sequence.is_empty() {
        tracing::warn!("Sequence validation failed: empty sequence");
        return false;
    }
    if VALID_AA_PATTERN.is_match(sequence) {
        return true;
    }
    let mut invalid: Vec<char> = sequence
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| !VALID_AA_PATTERN.is_match(c.encode_utf8(&mut [0; 4])))
        .collect();
    invalid.sort_unstable();
    invalid.dedup();
    tracing::warn!(
        "Sequence validation failed: invalid characters {:?} (starts with {})",
        invalid,
        sequence.chars().take(30).collect::<String>()
    );
    false
}

/// Whether `text` looks like a UniProt accession (optionally with an
/// isoform suffix) or an entry name such as `INS_HUMAN`.
pub fn is_potential_uniprot_id(text: &str) -> bool {
    UNIPROT_ACCESSION_PATTERN.is_match(text) || UNIPROT_ENTRY_NAME_PATTERN.is_match(text)
}
