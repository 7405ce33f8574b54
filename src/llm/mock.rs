//! Scripted text generator for tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{GenerationRequest, LlmError, TextGenerator};

/// Replies with canned responses in order and records every request.
///
/// Once the script runs out, further calls fail with
/// [`LlmError::EmptyResponse`].
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    script: Arc<Mutex<VecDeque<String>>>,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Arc::new(Mutex::new(responses.into_iter().map(Into::into).collect())),
            requests: Arc::default(),
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response.into());
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or(LlmError::EmptyResponse)
    }
}
