//! The inference backend seam.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Loads, runs and releases model instances.
///
/// Warden treats every operation as a black box of unbounded but finite
/// latency. A `Handle` owns whatever resources an instance holds (weights,
/// device memory); it is released exactly once, through
/// [`unload`](Self::unload).
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    /// A loaded model instance.
    type Handle: Send + Sync + 'static;

    /// Load `model_id` from `path`.
    async fn load(&self, model_id: &str, path: &Path) -> Result<Self::Handle>;

    /// Release an instance's resources.
    async fn unload(&self, handle: Self::Handle) -> Result<()>;

    /// Run one generation on a loaded instance.
    async fn generate(&self, handle: &Self::Handle, request: &GenerateRequest) -> Result<String>;
}

/// A text generation request.
///
/// ```rust
/// # use warden::model::GenerateRequest;
/// let request = GenerateRequest::new("What is my balance?")
///     .system_prompt("You are a ledger assistant.")
///     .temperature(0.2);
/// assert!(request.full_prompt().starts_with("System: "));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub context: Option<String>,
    /// Default: 2048.
    pub max_length: u32,
    /// Default: 0.7.
    pub temperature: f32,
    /// Default: 0.95.
    pub top_p: f32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            context: None,
            max_length: 2048,
            temperature: 0.7,
            top_p: 0.95,
        }
    }

    pub fn system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.max_length = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    /// The prompt with system and context sections prepended, each section
    /// separated by a blank line.
    pub fn full_prompt(&self) -> String {
        let mut sections = Vec::with_capacity(3);
        if let Some(system) = &self.system_prompt {
            sections.push(format!("System: {system}"));
        }
        if let Some(context) = &self.context {
            sections.push(format!("Context: {context}"));
        }
        sections.push(format!("User: {}", self.prompt));
        sections.join("\n\n")
    }
}
