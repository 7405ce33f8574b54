//! UniProt REST backend

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{
    validate_sequence, LookupConfig, LookupError, ProteinLookup, ProteinRecord, ProteinSummary,
    SearchQuery,
};

const FETCH_FIELDS: &str = "accession,id,organism_name,sequence";
const SEARCH_FIELDS: &str = "accession,id,protein_name,organism_name,length";

pub struct UniProtClient {
    client: Client,
    config: LookupConfig,
}

impl UniProtClient {
    pub fn new(config: LookupConfig) -> Result<Self, LookupError> {
        let client = Client::builder()
            .user_agent(concat!("toolbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LookupError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn search_url(&self) -> String {
        format!(
            "{}/uniprotkb/search",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn get_json(
        &self,
        query: &str,
        fields: &str,
        size: u32,
        timeout: std::time::Duration,
    ) -> Result<Value, LookupError> {
        let size = size.to_string();
        let response = self
            .client
            .get(self.search_url())
            .query(&[
                ("query", query),
                ("fields", fields),
                ("format", "json"),
                ("size", size.as_str()),
            ])
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::Status {
                status: status.as_u16(),
                details: error_details(&body),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| LookupError::Decode(e.to_string()))
    }
}

/// `messages` from a UniProt error body, or the start of the raw text.
fn error_details(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => match json.get("messages") {
            Some(messages) => messages.to_string(),
            None => json.to_string(),
        },
        Err(_) => body.chars().take(200).collect(),
    }
}

fn text_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |node, key| node.get(key))
        .and_then(Value::as_str)
}

/// First entry of an identifier lookup, if it carries a valid sequence.
pub fn parse_fetch_response(data: &Value, identifier: &str) -> Option<ProteinRecord> {
    let Some(entry) = data
        .get("results")
        .and_then(Value::as_array)
        .and_then(|results| results.first())
    else {
        tracing::warn!("UniProt entry not found: {}", identifier);
        return None;
    };

    let accession = entry
        .get("primaryAccession")
        .and_then(Value::as_str)
        .unwrap_or(identifier);
    let organism = text_at(entry, &["organism", "scientificName"]).unwrap_or("Unknown Organism");

    let Some(sequence) = text_at(entry, &["sequence", "value"]).filter(|s| !s.is_empty()) else {
        tracing::error!(
            "No sequence in UniProt entry {} (accession {})",
            identifier,
            accession
        );
        return None;
    };

    if !validate_sequence(sequence) {
        tracing::error!(
            "Sequence for {} (accession {}) failed validation",
            identifier,
            accession
        );
        return None;
    }

    Some(ProteinRecord {
        sequence: sequence.to_string(),
        organism: organism.to_string(),
        id: accession.to_string(),
    })
}

/// Rows of a search response. The display name falls back from the
/// recommended name to the first submitted name.
pub fn parse_search_response(data: &Value) -> Vec<ProteinSummary> {
    let Some(results) = data.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };

    results
        .iter()
        .map(|entry| {
            let description = entry.get("proteinDescription");
            let recommended = description
                .and_then(|d| text_at(d, &["recommendedName", "fullName", "value"]));
            let submitted = description
                .and_then(|d| d.get("submissionNames"))
                .and_then(Value::as_array)
                .and_then(|names| names.first())
                .and_then(|name| text_at(name, &["fullName", "value"]));

            ProteinSummary {
                id: entry
                    .get("primaryAccession")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                entry_name: entry
                    .get("uniProtkbId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                name: recommended.or(submitted).unwrap_or("N/A").to_string(),
                organism: text_at(entry, &["organism", "scientificName"])
                    .unwrap_or("N/A")
                    .to_string(),
                length: entry
                    .get("sequence")
                    .and_then(|s| s.get("length"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }
        })
        .collect()
}

#[async_trait]
impl ProteinLookup for UniProtClient {
    async fn fetch_by_id(&self, identifier: &str) -> Result<Option<ProteinRecord>, LookupError> {
        let identifier = identifier.trim();
        let query = format!(
            "accession:{} OR id:{}",
            identifier,
            identifier.to_uppercase()
        );
        tracing::info!("Fetching UniProt data for {}", identifier);
        let data = self
            .get_json(&query, FETCH_FIELDS, 1, self.config.request_timeout)
            .await?;
        let record = parse_fetch_response(&data, identifier);
        if let Some(record) = &record {
            tracing::info!(
                "Fetched {} (accession {}, organism {}, length {})",
                identifier,
                record.id,
                record.organism,
                record.sequence.len()
            );
        }
        Ok(record)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProteinSummary>, LookupError> {
        if query.query.trim().is_empty() {
            return Err(LookupError::EmptyQuery);
        }
        let full_query = query.to_query_string();
        tracing::debug!(
            "UniProt search query: {}, fields: {}, size: {}",
            full_query,
            SEARCH_FIELDS,
            query.limit
        );
        let data = self
            .get_json(&full_query, SEARCH_FIELDS, query.limit, self.config.search_timeout)
            .await?;
        let results = parse_search_response(&data);
        tracing::info!(
            "Search returned {} results (limit was {})",
            results.len(),
            query.limit
        );
        Ok(results)
    }
}
