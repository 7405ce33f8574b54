//! Declared tools and their parameters
//!
//! The catalog is consulted before a call is dispatched so that a request
//! with missing or mistyped arguments never reaches the worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CatalogError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{tool}' is missing required parameters: {}", missing.join(", "))]
    MissingParameters { tool: String, missing: Vec<String> },

    #[error("Tool '{tool}' does not accept parameter '{name}'")]
    UnknownParameter { tool: String, name: String },

    #[error("Parameter '{name}' of tool '{tool}' must be {expected}")]
    TypeMismatch {
        tool: String,
        name: String,
        expected: ParamType,
    },

    #[error("Arguments for tool '{0}' must be a JSON object")]
    NotAnObject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamType::String => write!(f, "a string"),
            ParamType::Integer => write!(f, "an integer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub description: String,
    pub parameters: BTreeMap<String, ParamSpec>,
    pub returns: String,
}

impl ToolSpec {
    pub fn new(description: &str, returns: &str) -> Self {
        Self {
            description: description.to_string(),
            parameters: BTreeMap::new(),
            returns: returns.to_string(),
        }
    }

    pub fn required(self, name: &str, kind: ParamType, description: &str) -> Self {
        self.param(name, kind, description, true)
    }

    pub fn optional(self, name: &str, kind: ParamType, description: &str) -> Self {
        self.param(name, kind, description, false)
    }

    fn param(mut self, name: &str, kind: ParamType, description: &str, required: bool) -> Self {
        self.parameters.insert(
            name.to_string(),
            ParamSpec {
                kind,
                description: description.to_string(),
                required,
            },
        );
        self
    }

    pub fn required_names(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
    }
}

/// Static mapping from tool name to its declared parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tools served by `toolbridge serve`.
    pub fn protein_tools() -> Self {
        Self::new()
            .with_tool(
                "predict_protein_function_tool",
                ToolSpec::new(
                    "Predict the biological function of a protein from its amino acid sequence. Requires the sequence; the source organism is optional.",
                    "Object with 'predicted_function', 'confidence', 'model_version' and 'processing_time_sec', or an error.",
                )
                .required("sequence", ParamType::String, "Required. Amino acid sequence of the protein.")
                .optional("organism", ParamType::String, "Optional. Scientific name of the source organism."),
            )
            .with_tool(
                "get_protein_data",
                ToolSpec::new(
                    "Fetch details for a protein by UniProt accession or entry name, including sequence and organism.",
                    "Object with 'sequence', 'organism' and 'id', or an error.",
                )
                .required("identifier", ParamType::String, "Required. UniProt accession (e.g. P00533) or entry name (e.g. INS_HUMAN)."),
            )
            .with_tool(
                "search_proteins",
                ToolSpec::new(
                    "Search the UniProt database for proteins by keyword, species and other criteria.",
                    "Array of proteins, each with 'id', 'entry_name', 'name', 'organism' and 'length', or an error.",
                )
                .required("query", ParamType::String, "Required. Search terms such as a gene name or function.")
                .optional("species_filter", ParamType::String, "Optional. Scientific species name or NCBI taxonomy id.")
                .optional("keyword_filter", ParamType::String, "Optional. UniProt keyword filter.")
                .optional("limit", ParamType::Integer, "Optional. Maximum number of results, default 10."),
            )
            .with_tool(
                "echo",
                ToolSpec::new("Echo a message back; useful to check the worker is alive.", "String")
                    .required("message", ParamType::String, "Required. Text to echo."),
            )
    }

    pub fn with_tool(mut self, name: &str, spec: ToolSpec) -> Self {
        self.tools.insert(name.to_string(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ToolSpec)> {
        self.tools.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Required parameters of `tool` that are absent (or null) in `arguments`.
    pub fn missing_required(&self, tool: &str, arguments: &Value) -> Result<Vec<String>, CatalogError> {
        let spec = self
            .get(tool)
            .ok_or_else(|| CatalogError::UnknownTool(tool.to_string()))?;
        let empty = Map::new();
        let provided = arguments.as_object().unwrap_or(&empty);
        Ok(spec
            .required_names()
            .filter(|name| provided.get(*name).map_or(true, Value::is_null))
            .map(str::to_string)
            .collect())
    }

    /// Check `arguments` against the declaration of `tool`.
    ///
    /// Null values for optional parameters are treated as absent.
    pub fn validate(&self, tool: &str, arguments: &Value) -> Result<(), CatalogError> {
        let spec = self
            .get(tool)
            .ok_or_else(|| CatalogError::UnknownTool(tool.to_string()))?;
        let provided = arguments
            .as_object()
            .ok_or_else(|| CatalogError::NotAnObject(tool.to_string()))?;

        let missing = self.missing_required(tool, arguments)?;
        if !missing.is_empty() {
            return Err(CatalogError::MissingParameters {
                tool: tool.to_string(),
                missing,
            });
        }

        for (name, value) in provided {
            let param = spec
                .parameters
                .get(name)
                .ok_or_else(|| CatalogError::UnknownParameter {
                    tool: tool.to_string(),
                    name: name.clone(),
                })?;
            if !value.is_null() && !param.kind.accepts(value) {
                return Err(CatalogError::TypeMismatch {
                    tool: tool.to_string(),
                    name: name.clone(),
                    expected: param.kind,
                });
            }
        }
        Ok(())
    }

    /// Pretty JSON description of every tool, as embedded in planning prompts.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protein_catalog_declares_required_params() {
        let catalog = ToolCatalog::protein_tools();
        assert_eq!(catalog.len(), 4);
        let search = catalog.get("search_proteins").unwrap();
        assert_eq!(search.required_names().collect::<Vec<_>>(), vec!["query"]);
        assert_eq!(search.parameters["limit"].kind, ParamType::Integer);
    }

    #[test]
    fn test_validate_accepts_complete_arguments() {
        let catalog = ToolCatalog::protein_tools();
        assert!(catalog
            .validate(
                "search_proteins",
                &json!({"query": "insulin", "limit": 5, "species_filter": null})
            )
            .is_ok());
    }

    #[test]
    fn test_validate_reports_missing_required() {
        let catalog = ToolCatalog::protein_tools();
        let err = catalog
            .validate("predict_protein_function_tool", &json!({"organism": "Homo sapiens"}))
            .unwrap_err();
        assert_eq!(
            err,
            CatalogError::MissingParameters {
                tool: "predict_protein_function_tool".to_string(),
                missing: vec!["sequence".to_string()],
            }
        );
        assert_eq!(
            err.to_string(),
            "Tool 'predict_protein_function_tool' is missing required parameters: sequence"
        );
    }

    #[test]
    fn test_validate_rejects_unknown_and_mistyped() {
        let catalog = ToolCatalog::protein_tools();
        assert!(matches!(
            catalog.validate("fold_protein", &json!({})),
            Err(CatalogError::UnknownTool(_))
        ));
        assert!(matches!(
            catalog.validate("get_protein_data", &json!({"identifier": "P1", "extra": 1})),
            Err(CatalogError::UnknownParameter { .. })
        ));
        assert!(matches!(
            catalog.validate("search_proteins", &json!({"query": "x", "limit": "ten"})),
            Err(CatalogError::TypeMismatch { .. })
        ));
        assert!(matches!(
            catalog.validate("echo", &json!(["hi"])),
            Err(CatalogError::NotAnObject(_))
        ));
    }

    #[test]
    fn test_missing_required_treats_null_as_absent() {
        let catalog = ToolCatalog::protein_tools();
        let missing = catalog
            .missing_required("get_protein_data", &json!({"identifier": null}))
            .unwrap();
        assert_eq!(missing, vec!["identifier"]);
    }

    #[test]
    fn test_catalog_json_shape() {
        let json: Value =
            serde_json::from_str(&ToolCatalog::protein_tools().to_json_pretty().unwrap()).unwrap();
        assert_eq!(
            json["get_protein_data"]["parameters"]["identifier"]["type"],
            "string"
        );
        assert_eq!(
            json["get_protein_data"]["parameters"]["identifier"]["required"],
            true
        );
    }
}
