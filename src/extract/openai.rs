//! Field extraction via an OpenAI-compatible `/chat/completions` endpoint.
//! By default this talks to OpenRouter.

use std::{fmt, time::Instant};

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, FinishReason, ResponseFormat,
    },
};
use keen_retry::{ExponentialJitter, ResolvedResult};
use leaky_bucket::RateLimiter;

use crate::{
    prelude::*,
    prompt::{ChatPrompt, to_openai_messages},
    resume::parsed_resume_schema,
    retry::{
        IntoRetryResult as _, IsKnownTransient as _, SimpleRetryResult, retry_result_ok,
        try_with_retry_result,
    },
};

use super::{FieldExtractor, LlmError, LlmOpts, RawResponse, ResponseMode, TokenUsage};

/// Where we send requests unless `OPENAI_API_BASE` says otherwise.
pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Create an OpenAI-compatible client from the environment.
///
/// `OPENAI_API_KEY` wins over `OPENROUTER_API_KEY`.
pub fn create_llm_client() -> Client<OpenAIConfig> {
    let api_base =
        std::env::var("OPENAI_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_owned());
    let mut client_config = OpenAIConfig::new().with_api_base(api_base);
    match std::env::var("OPENAI_API_KEY").or_else(|_| std::env::var("OPENROUTER_API_KEY")) {
        Ok(api_key) => client_config = client_config.with_api_key(api_key),
        Err(_) => warn!("neither OPENAI_API_KEY nor OPENROUTER_API_KEY is set"),
    }
    Client::with_config(client_config)
}

/// A [`FieldExtractor`] backed by an OpenAI-compatible chat API.
pub struct OpenAiExtractor {
    client: Client<OpenAIConfig>,
    model: String,
    mode: ResponseMode,
    prompt: ChatPrompt,
    /// Pretty-printed résumé schema, for the `{{schema}}` binding.
    schema: String,
    llm_opts: LlmOpts,
    rate_limiter: Option<RateLimiter>,
}

impl OpenAiExtractor {
    /// Create a new extractor.
    pub fn new(
        model: &str,
        mode: ResponseMode,
        prompt: ChatPrompt,
        llm_opts: LlmOpts,
    ) -> Result<Self> {
        let schema = serde_json::to_string_pretty(&parsed_resume_schema())
            .context("failed to serialize resume schema")?;
        let rate_limiter = llm_opts.rate_limit.as_ref().map(|rl| rl.to_rate_limiter());
        Ok(Self {
            client: create_llm_client(),
            model: model.to_owned(),
            mode,
            prompt,
            schema,
            llm_opts,
            rate_limiter,
        })
    }

    /// Build the request for one résumé.
    fn build_request(&self, text: &str) -> Result<CreateChatCompletionRequest> {
        let bindings = json!({ "text": text, "schema": self.schema });
        let messages = to_openai_messages(&self.prompt.render(&bindings)?)?;

        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(self.model.clone()).messages(messages);
        if self.mode == ResponseMode::Json {
            req.response_format(ResponseFormat::JsonObject);
        }
        if let Some(max_completion_tokens) = self.llm_opts.max_completion_tokens {
            req.max_completion_tokens(max_completion_tokens);
        }
        if let Some(temperature) = self.llm_opts.temperature {
            req.temperature(temperature);
        }
        let req = req.build().context("error building request")?;
        trace!(?req, "Request");
        Ok(req)
    }

    /// Make a single call, classifying any failure as transient or fatal.
    async fn call_once(
        &self,
        req: &CreateChatCompletionRequest,
    ) -> SimpleRetryResult<(String, Option<TokenUsage>)> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let chat = self.client.chat();
        let chat_result: Value = try_with_retry_result!(
            self.llm_opts
                .apply_timeout(chat.create_byot::<_, Value>(req))
                .await
                .into_retry_result(LlmError::is_known_transient)
        );
        debug!(%chat_result, "LLM response");
        let output = try_with_retry_result!(content_from_response(chat_result).into_fatal());
        retry_result_ok(output)
    }
}

/// Pull the content and token usage out of a chat completion response.
///
/// Nothing has been stored yet when this fails, so errors carry the raw
/// response body.
fn content_from_response(chat_result: Value) -> Result<(String, Option<TokenUsage>)> {
    let raw_body = chat_result.to_string();
    let response = serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
        .with_context(|| format!("error parsing chat completion response: {}", raw_body))?;

    let token_usage = response.usage.map(|usage| TokenUsage {
        prompt_tokens: u64::from(usage.prompt_tokens),
        completion_tokens: u64::from(usage.completion_tokens),
    });

    let Some(choice) = response.choices.first() else {
        return Err(anyhow!("no choices in chat completion response: {}", raw_body));
    };
    if choice.finish_reason == Some(FinishReason::ContentFilter) {
        return Err(anyhow!("content filter triggered: {}", raw_body));
    }
    if choice.finish_reason == Some(FinishReason::Length) {
        warn!("LLM response was truncated at the completion token limit");
    }
    match choice.message.content.as_deref() {
        Some(content) if !content.trim().is_empty() => Ok((content.to_owned(), token_usage)),
        _ => Err(anyhow!("LLM response has no content: {}", raw_body)),
    }
}

impl fmt::Debug for OpenAiExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiExtractor")
            .field("model", &self.model)
            .field("mode", &self.mode)
            .field("llm_opts", &self.llm_opts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FieldExtractor for OpenAiExtractor {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %job_id, model = %self.model))]
    async fn extract(&self, job_id: &str, text: &str) -> Result<RawResponse> {
        let req = self.build_request(text)?;
        let started = Instant::now();

        let first_attempt = self.call_once(&req).await;
        let retries = self.llm_opts.llm_retries;
        let ((content, token_usage), errors) = if retries == 0 {
            match first_attempt {
                keen_retry::RetryResult::Ok { output, .. } => (output, vec![]),
                keen_retry::RetryResult::Transient { error, .. }
                | keen_retry::RetryResult::Fatal { error, .. } => return Err(error),
            }
        } else {
            let resolved = first_attempt
                .retry_with_async(|_| self.call_once(&req))
                .with_exponential_jitter(|| ExponentialJitter::FromBackoffRange {
                    backoff_range_millis: 1..=30_000,
                    re_attempts: retries,
                    jitter_ratio: 0.2,
                })
                .await
                .inspect_recovered(|_, _, retry_errors_list| {
                    warn!(
                        "succeeded after retrying {} times (failed attempts: [{}])",
                        retry_errors_list.len(),
                        keen_retry::loggable_retry_errors(retry_errors_list)
                    )
                });
            match resolved {
                ResolvedResult::Ok { output, .. } => (output, vec![]),
                ResolvedResult::Recovered {
                    output,
                    retry_errors,
                    ..
                } => (
                    output,
                    retry_errors.iter().map(|e| format!("{e:#}")).collect(),
                ),
                ResolvedResult::Fatal { error, .. } => return Err(error),
                ResolvedResult::GivenUp {
                    retry_errors,
                    fatal_error,
                    ..
                }
                | ResolvedResult::Unrecoverable {
                    retry_errors,
                    fatal_error,
                    ..
                } => {
                    return Err(fatal_error.context(format!(
                        "gave up after {} failed attempts",
                        retry_errors.len() + 1
                    )));
                }
            }
        };

        let duration_secs = started.elapsed().as_secs_f64();
        info!(
            model = %self.model,
            duration_secs,
            prompt_tokens = token_usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens = token_usage.as_ref().map(|u| u.completion_tokens),
            "LLM extraction complete"
        );
        Ok(RawResponse {
            model: self.model.clone(),
            mode: self.mode,
            content,
            token_usage,
            duration_secs,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(mode: ResponseMode) -> OpenAiExtractor {
        OpenAiExtractor::new(
            super::super::DEFAULT_MODEL,
            mode,
            mode.default_prompt().unwrap(),
            LlmOpts {
                temperature: Some(0.0),
                ..LlmOpts::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn json_mode_requests_a_json_object() {
        let req = extractor(ResponseMode::Json)
            .build_request("Jane Doe\njane@example.com")
            .unwrap();
        let req = serde_json::to_value(&req).unwrap();
        assert_eq!(req["model"], "amazon/nova-micro-v1");
        assert_eq!(req["response_format"]["type"], "json_object");
        assert_eq!(req["messages"][0]["role"], "system");
        let user = req["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("jane@example.com"));
        assert!(user.contains("\"personal_info\""));
    }

    #[test]
    fn markdown_mode_sends_plain_text() {
        let req = extractor(ResponseMode::Markdown)
            .build_request("R&D lead")
            .unwrap();
        let req = serde_json::to_value(&req).unwrap();
        assert!(req.get("response_format").is_none());
        let user = req["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("### PERSONAL INFORMATION"));
        assert!(user.contains("R&D lead"));
    }

    fn chat_completion(content: Value, finish_reason: &str) -> Value {
        json!({
            "id": "gen-123",
            "object": "chat.completion",
            "created": 1735689600,
            "model": "amazon/nova-micro-v1",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": finish_reason,
            }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 40, "total_tokens": 160 },
        })
    }

    #[test]
    fn content_and_usage_are_extracted() {
        let (content, usage) =
            content_from_response(chat_completion(json!("{\"skills\": {}}"), "stop")).unwrap();
        assert_eq!(content, "{\"skills\": {}}");
        assert_eq!(
            usage,
            Some(TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 40,
            })
        );
    }

    #[test]
    fn content_filter_errors_keep_the_raw_body() {
        let err = content_from_response(chat_completion(json!(null), "content_filter"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("content filter triggered"), "{err}");
        assert!(err.contains("gen-123"), "{err}");
        assert!(err.contains("content_filter"), "{err}");
    }

    #[test]
    fn empty_content_errors_keep_the_raw_body() {
        let err = content_from_response(chat_completion(json!("  "), "stop"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("has no content"), "{err}");
        assert!(err.contains("gen-123"), "{err}");

        let mut no_choices = chat_completion(json!(null), "stop");
        no_choices["choices"] = json!([]);
        let err = content_from_response(no_choices).unwrap_err().to_string();
        assert!(err.contains("no choices"), "{err}");
        assert!(err.contains("amazon/nova-micro-v1"), "{err}");
    }

    #[tokio::test]
    #[ignore = "Needs OPENROUTER_API_KEY and network access"]
    async fn live_extraction() {
        dotenvy::dotenv().ok();
        let raw = extractor(ResponseMode::Json)
            .extract(
                "live-test",
                "Jane Doe\njane@example.com\nSoftware Engineer at Acme, 2020-2024",
            )
            .await
            .unwrap();
        assert!(!raw.content.is_empty());
    }
}
