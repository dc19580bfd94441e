//! Structured field extraction via an LLM.
//!
//! A [`FieldExtractor`] takes cleaned résumé text and returns a
//! [`RawResponse`]: the model's output exactly as received, plus bookkeeping.
//! Nothing in here interprets the content; that's [`parse`]'s job, and it
//! runs only after the raw response is safely on disk.

use std::{fmt, ops::AddAssign, pin::Pin, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, TryFutureExt as _};
use schemars::JsonSchema;
use tokio::time;

use crate::{
    prelude::*, prompt::ChatPrompt, rate_limit::RateLimit, retry::IsKnownTransient,
};

pub mod openai;
pub mod parse;

/// The default model. Cheap, and good enough at following formats.
pub const DEFAULT_MODEL: &str = "amazon/nova-micro-v1";

/// What format we ask the model to reply in.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ResponseMode {
    /// A JSON object, requested via `response_format`.
    #[default]
    Json,
    /// Sectioned Markdown (`### EDUCATION`, `- **Degree:** BSc`).
    Markdown,
}

impl ResponseMode {
    /// The built-in prompt for this mode.
    pub fn default_prompt(self) -> Result<ChatPrompt> {
        match self {
            ResponseMode::Json => {
                ChatPrompt::from_toml_str(include_str!("default_json_prompt.toml"))
            }
            ResponseMode::Markdown => {
                ChatPrompt::from_toml_str(include_str!("default_markdown_prompt.toml"))
            }
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMode::Json => write!(f, "json"),
            ResponseMode::Markdown => write!(f, "markdown"),
        }
    }
}

/// Token usage.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// The verbatim output of one extraction call, as stored in
/// `raw_response.json`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RawResponse {
    /// The model that answered.
    pub model: String,

    /// The format we asked for. `reparse` uses this to pick a parser.
    pub mode: ResponseMode,

    /// The message content, unmodified.
    pub content: String,

    /// Token usage, if the service reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    /// Wall-clock time for the call, including retries.
    pub duration_secs: f64,

    /// Transient errors we recovered from by retrying.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Interface for anything that can pull résumé fields out of text.
#[async_trait]
pub trait FieldExtractor: fmt::Debug + Send + Sync + 'static {
    /// The model name, for logging.
    fn model(&self) -> &str;

    /// Send `text` to the model and return its raw response.
    async fn extract(&self, job_id: &str, text: &str) -> Result<RawResponse>;
}

/// LLM request options.
#[derive(Args, Clone, Debug, Default)]
pub struct LlmOpts {
    /// An upper limit on the number of completion tokens to generate.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// Sampling temperature, between 0.0 and 2.0. Defaults to the model's
    /// default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// A timeout, in seconds, for the LLM to return a complete response.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A rate limit for LLM API requests, of the form "10/s" or "100/m".
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// How many times to retry known-transient LLM failures (HTTP 429, 502,
    /// 503, 504 and timeouts). Other failures are never retried.
    #[clap(long, default_value_t = 0)]
    pub llm_retries: u8,
}

impl LlmOpts {
    /// Apply our timeout (if any) to a future.
    ///
    /// The result is boxed because the two branches have different future
    /// types. `'fut` carries the lifetime of anything `future` borrows.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        if let Some(timeout) = self.timeout {
            time::timeout(Duration::from_secs(timeout), future)
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout),
                })
                .boxed()
        } else {
            future.boxed()
        }
    }
}

/// Options for building a [`FieldExtractor`].
#[derive(Args, Clone, Debug)]
pub struct ExtractorOpts {
    /// The model to use for field extraction.
    #[clap(long, env = "RESUME_INGEST_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// What format to ask the model for.
    #[clap(long, value_enum, default_value_t = ResponseMode::default())]
    pub response_mode: ResponseMode,

    /// A TOML prompt file to use instead of the built-in prompt for
    /// `--response-mode`. It may use `{{text}}` and `{{schema}}`.
    #[clap(long)]
    pub prompt: Option<PathBuf>,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,
}

impl ExtractorOpts {
    /// Load our prompt.
    pub async fn load_prompt(&self) -> Result<ChatPrompt> {
        match &self.prompt {
            Some(path) => ChatPrompt::from_path(path).await,
            None => self.response_mode.default_prompt(),
        }
    }

    /// Build the configured extractor.
    pub async fn create_extractor(&self) -> Result<Arc<dyn FieldExtractor>> {
        let prompt = self.load_prompt().await?;
        Ok(Arc::new(openai::OpenAiExtractor::new(
            &self.model,
            self.response_mode,
            prompt,
            self.llm_opts.clone(),
        )?))
    }
}

/// An error which occurred while calling an LLM.
#[derive(Debug, thiserror::Error)]
pub enum LlmError<E>
where
    E: std::error::Error + 'static,
{
    /// An error from the underlying client.
    #[error(transparent)]
    Native(E),

    /// The response did not arrive in time.
    #[error("LLM request timed out")]
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: std::error::Error + IsKnownTransient + 'static,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway responses and overloaded servers may do better next time.
            LlmError::Timeout => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_prompts_parse() {
        for mode in [ResponseMode::Json, ResponseMode::Markdown] {
            let prompt = mode.default_prompt().unwrap();
            let rendered = prompt
                .render(&json!({ "text": "Jane Doe", "schema": "{}" }))
                .unwrap();
            assert_eq!(rendered.len(), 2, "{mode}");
        }
    }

    #[test]
    fn token_usage_adds_up() {
        let mut total = TokenUsage::default();
        assert!(total.is_zero());
        total += TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
        };
        total += TokenUsage {
            prompt_tokens: 5,
            completion_tokens: 1,
        };
        assert_eq!(total.prompt_tokens, 105);
        assert_eq!(total.completion_tokens, 21);
    }

    #[tokio::test]
    async fn timeouts_are_transient() {
        let opts = LlmOpts {
            timeout: Some(0),
            ..LlmOpts::default()
        };
        let slow = async {
            time::sleep(Duration::from_secs(5)).await;
            Ok::<_, std::io::Error>(())
        };
        let err = opts.apply_timeout(slow).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
    }

    #[test]
    fn raw_responses_round_trip_through_json() {
        let raw = RawResponse {
            model: DEFAULT_MODEL.to_owned(),
            mode: ResponseMode::Markdown,
            content: "### SKILLS\n- Rust".to_owned(),
            token_usage: None,
            duration_secs: 1.5,
            errors: vec![],
        };
        let json = serde_json::to_value(&raw).unwrap();
        assert_eq!(json["mode"], "markdown");
        assert!(json.get("token_usage").is_none());
        assert_eq!(serde_json::from_value::<RawResponse>(json).unwrap(), raw);
    }
}
