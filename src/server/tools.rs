//! Protein tools served by `toolbridge serve`

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{parse_params, ToolContext, ToolHandler, ToolRegistry};
use crate::lookup::{validate_sequence, ProteinLookup, SearchQuery, DEFAULT_SEARCH_LIMIT};
use crate::worker::protocol::{ToolFailure, INTERNAL_ERROR, INVALID_PARAMS};

pub const MODEL_VERSION: &str = "sim_v0.2";

const POSSIBLE_FUNCTIONS: &[&str] = &[
    "Enzyme - kinase",
    "Transcription factor",
    "Membrane transporter",
    "Structural protein",
    "Signaling protein - receptor",
    "Immune response protein",
    "Unknown / hypothetical protein",
];

/// Register the protein tools and `echo`.
pub fn register_protein_tools(
    registry: &mut ToolRegistry,
    lookup: Arc<dyn ProteinLookup>,
    predictor: FunctionPredictor,
) {
    registry
        .register("echo", EchoTool)
        .register(
            "get_protein_data",
            GetProteinData {
                lookup: Arc::clone(&lookup),
            },
        )
        .register("search_proteins", SearchProteins { lookup })
        .register("predict_protein_function_tool", predictor);
}

pub struct EchoTool;

#[derive(Deserialize)]
struct EchoParams {
    message: String,
}

#[async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, params: Value, _ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: EchoParams = parse_params(params)?;
        Ok(json!(format!("You said: {}", params.message)))
    }
}

pub struct GetProteinData {
    lookup: Arc<dyn ProteinLookup>,
}

#[derive(Deserialize)]
struct GetProteinDataParams {
    identifier: String,
}

#[async_trait]
impl ToolHandler for GetProteinData {
    async fn call(&self, params: Value, _ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: GetProteinDataParams = parse_params(params)?;
        let identifier = params.identifier;
        let not_found = || {
            ToolFailure::new(format!(
                "Identifier '{identifier}' not found or data could not be retrieved."
            ))
        };

        match self.lookup.fetch_by_id(&identifier).await {
            Ok(Some(record)) => {
                tracing::info!("Data fetched for {}: found {}", identifier, record.id);
                serde_json::to_value(record)
                    .map_err(|e| ToolFailure::new(e.to_string()).with_code(INTERNAL_ERROR))
            }
            Ok(None) => Err(not_found()),
            Err(e) => {
                tracing::error!("Lookup of {} failed: {}", identifier, e);
                Err(not_found())
            }
        }
    }
}

pub struct SearchProteins {
    lookup: Arc<dyn ProteinLookup>,
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default)]
    species_filter: Option<String>,
    #[serde(default)]
    keyword_filter: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[async_trait]
impl ToolHandler for SearchProteins {
    async fn call(&self, params: Value, _ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: SearchParams = parse_params(params)?;
        if params.query.trim().is_empty() {
            return Err(ToolFailure::new("Search query cannot be empty.").with_code(INVALID_PARAMS));
        }

        let mut query = SearchQuery::new(params.query)
            .limit(params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT as i64));
        query.species_filter = params.species_filter;
        query.keyword_filter = params.keyword_filter;

        let results = self
            .lookup
            .search(&query)
            .await
            .map_err(|e| ToolFailure::new(format!("UniProt search failed: {e}")))?;
        serde_json::to_value(results)
            .map_err(|e| ToolFailure::new(e.to_string()).with_code(INTERNAL_ERROR))
    }
}

/// Simulated function predictor: random label and confidence after a
/// random delay.
#[derive(Debug, Clone)]
pub struct FunctionPredictor {
    delay_ms: Range<u64>,
}

impl Default for FunctionPredictor {
    fn default() -> Self {
        Self { delay_ms: 200..800 }
    }
}

impl FunctionPredictor {
    pub fn with_delay(delay_ms: Range<u64>) -> Self {
        Self { delay_ms }
    }
}

#[derive(Deserialize)]
struct PredictParams {
    sequence: String,
    #[serde(default)]
    organism: Option<String>,
}

#[async_trait]
impl ToolHandler for FunctionPredictor {
    async fn call(&self, params: Value, _ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: PredictParams = parse_params(params)?;
        if !validate_sequence(&params.sequence) {
            return Err(ToolFailure::new(
                "Invalid protein sequence: only standard amino acid letters are allowed.",
            )
            .with_code(INVALID_PARAMS));
        }

        let started = Instant::now();
        tracing::info!(
            "Prediction requested: sequence length {}, organism '{}'",
            params.sequence.len(),
            params.organism.as_deref().unwrap_or("")
        );

        let delay = if self.delay_ms.is_empty() {
            self.delay_ms.start
        } else {
            rand::rng().random_range(self.delay_ms.clone())
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let (function, confidence) = {
            let mut rng = rand::rng();
            let function = POSSIBLE_FUNCTIONS
                .choose(&mut rng)
                .copied()
                .unwrap_or("Unknown / hypothetical protein");
            let confidence: f64 = rng.random_range(0.5..0.99);
            (function, (confidence * 1000.0).round() / 1000.0)
        };
        let elapsed = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;

        tracing::info!(
            "Prediction finished in {:.3}s: '{}' (confidence {})",
            elapsed,
            function,
            confidence
        );
        Ok(json!({
            "predicted_function": function,
            "confidence": confidence,
            "model_version": MODEL_VERSION,
            "processing_time_sec": elapsed,
        }))
    }
}
