//! Generation requests and the outbound provider body
//!
//! A [`GenerationRequest`] is what an already-authorized caller submits. It
//! is immutable once handed to the coordinator, which turns it into a
//! [`ProviderRequest`] (the JSON body POSTed upstream) once the session id
//! and the chapter context are known.

use crate::config::ProviderConfig;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of the caller and the chapter being generated into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// User who started the generation
    pub user_id: String,
    /// Workspace the project belongs to
    pub workspace_id: String,
    /// Project holding the document
    pub project_id: String,
    /// Order of the target chapter within the document
    pub chapter_order: u32,
}

/// One phrase whose sampling weight is adjusted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhraseBias {
    /// Phrase to bias
    pub phrase: String,
    /// Positive values favour the phrase, negative values suppress it
    pub bias: f64,
}

/// Sampling configuration forwarded as `generation_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Upper bound on generated tokens
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Lower bound on generated tokens
    #[serde(default = "default_min_output_tokens")]
    pub min_output_tokens: u32,
    /// Nucleus (top-p) sampling
    #[serde(default = "default_probability")]
    pub nucleus_sampling: f64,
    /// Top-k sampling, 0 disables it
    #[serde(default)]
    pub top_k: u32,
    /// Top-a sampling
    #[serde(default = "default_probability")]
    pub top_a: f64,
    /// Tail-free sampling
    #[serde(default = "default_probability")]
    pub tail_free_sampling: f64,
    /// Repetition penalty
    #[serde(default)]
    pub repetition_penalty: f64,
    /// Phrase weight adjustments
    #[serde(default)]
    pub phrase_bias: Vec<PhraseBias>,
    /// Phrases the model must not produce
    #[serde(default, rename = "banned_tokens", alias = "banned_phrases")]
    pub banned_phrases: Vec<String>,
    /// Sequences that end generation
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

fn default_temperature() -> f64 {
    1.0
}

fn default_max_output_tokens() -> u32 {
    300
}

fn default_min_output_tokens() -> u32 {
    50
}

fn default_probability() -> f64 {
    0.85
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            min_output_tokens: default_min_output_tokens(),
            nucleus_sampling: default_probability(),
            top_k: 0,
            top_a: default_probability(),
            tail_free_sampling: default_probability(),
            repetition_penalty: 0.0,
            phrase_bias: Vec::new(),
            banned_phrases: Vec::new(),
            stop_sequences: Vec::new(),
        }
    }
}

/// Story context forwarded as `prompt_config`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContext {
    /// Text preceding the generation point; loaded from the chapter when absent
    #[serde(default)]
    pub prior_text: Option<String>,
    /// Story genre
    #[serde(default)]
    pub genre: String,
    /// Story tone
    #[serde(default)]
    pub tone: String,
    /// Narrative point of view
    #[serde(default)]
    pub pov: String,
}

/// A request to stream generated text into one chapter
///
/// # Examples
///
/// ```
/// use storyrelay::request::{CallerIdentity, GenerationRequest};
///
/// let request = GenerationRequest::new(
///     CallerIdentity {
///         user_id: "7".to_string(),
///         workspace_id: "ws".to_string(),
///         project_id: "p1".to_string(),
///         chapter_order: 0,
///     },
///     "The lighthouse keeper woke to silence.",
/// );
/// assert!(request.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Who is asking, and for which chapter
    pub caller: CallerIdentity,
    /// Prompt text
    pub prompt: String,
    /// Instruction; the configured default is used when absent
    #[serde(default)]
    pub instruction: Option<String>,
    /// Model; the configured default is used when absent
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling parameters
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Story context
    #[serde(default)]
    pub context: DocumentContext,
}

impl GenerationRequest {
    /// Create a request with default sampling and empty context
    pub fn new(caller: CallerIdentity, prompt: impl Into<String>) -> Self {
        Self {
            caller,
            prompt: prompt.into(),
            instruction: None,
            model: None,
            sampling: SamplingConfig::default(),
            context: DocumentContext::default(),
        }
    }

    /// Reject requests the provider could never satisfy
    pub fn validate(&self) -> Result<(), RelayError> {
        let caller = &self.caller;
        for (name, value) in [
            ("user_id", &caller.user_id),
            ("workspace_id", &caller.workspace_id),
            ("project_id", &caller.project_id),
        ] {
            if value.trim().is_empty() {
                return Err(RelayError::InvalidRequest(format!("{} is required", name)));
            }
        }

        if self.prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest("prompt is required".to_string()));
        }

        let s = &self.sampling;
        if !(0.0..=2.0).contains(&s.temperature) {
            return Err(RelayError::InvalidRequest(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                s.temperature
            )));
        }
        if s.max_output_tokens == 0 {
            return Err(RelayError::InvalidRequest(
                "max_output_tokens must be greater than 0".to_string(),
            ));
        }
        if s.min_output_tokens > s.max_output_tokens {
            return Err(RelayError::InvalidRequest(format!(
                "min_output_tokens ({}) exceeds max_output_tokens ({})",
                s.min_output_tokens, s.max_output_tokens
            )));
        }
        for (name, value) in [
            ("nucleus_sampling", s.nucleus_sampling),
            ("top_a", s.top_a),
            ("tail_free_sampling", s.tail_free_sampling),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RelayError::InvalidRequest(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }
        if s.repetition_penalty < 0.0 {
            return Err(RelayError::InvalidRequest(
                "repetition_penalty cannot be negative".to_string(),
            ));
        }

        Ok(())
    }
}

/// Pick the provider family from a model name
///
/// # Examples
///
/// ```
/// use storyrelay::request::provider_for_model;
///
/// assert_eq!(provider_for_model("gpt-4o-mini"), "openai");
/// assert_eq!(provider_for_model("Gemini-1.5-Pro"), "gemini");
/// assert_eq!(provider_for_model("mistral-large"), "openai");
/// ```
pub fn provider_for_model(model: &str) -> &'static str {
    let model = model.to_lowercase();
    if model.contains("gpt") {
        "openai"
    } else if model.contains("gemini") {
        "gemini"
    } else if model.contains("deepseek") {
        "deepseek"
    } else {
        "openai"
    }
}

/// `prompt_config` block of the outbound body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    pub context: String,
    pub genre: String,
    pub tone: String,
    pub pov: String,
}

/// `caller` block of the outbound body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerBlock {
    pub user_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub session_id: String,
    pub api_keys: BTreeMap<String, String>,
}

/// JSON body POSTed to the provider's streaming endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub usecase: String,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub instruction: String,
    pub stream: bool,
    pub generation_config: SamplingConfig,
    pub prompt_config: PromptConfig,
    pub caller: CallerBlock,
}

impl ProviderRequest {
    /// Build the outbound body for one session
    ///
    /// `context` is the resolved prior text: the request's own when given,
    /// otherwise whatever the coordinator loaded from the chapter.
    pub fn build(
        request: &GenerationRequest,
        session_id: &str,
        context: String,
        provider: &ProviderConfig,
    ) -> Self {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model.clone());

        Self {
            usecase: provider.usecase.clone(),
            provider: provider_for_model(&model).to_string(),
            model,
            prompt: request.prompt.clone(),
            instruction: request
                .instruction
                .clone()
                .unwrap_or_else(|| provider.instruction.clone()),
            stream: true,
            generation_config: request.sampling.clone(),
            prompt_config: PromptConfig {
                context,
                genre: request.context.genre.clone(),
                tone: request.context.tone.clone(),
                pov: request.context.pov.clone(),
            },
            caller: CallerBlock {
                user_id: request.caller.user_id.clone(),
                workspace_id: request.caller.workspace_id.clone(),
                project_id: request.caller.project_id.clone(),
                session_id: session_id.to_string(),
                api_keys: provider.api_keys.clone(),
            },
        }
    }
}
