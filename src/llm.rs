use anyhow::{anyhow, Result};
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, CreateChatCompletionResponse, ResponseFormat,
};
use async_openai::Client as OpenAIClient;
use async_trait::async_trait;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use ollama_rs::Ollama;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{LlmConfig, LlmType};
use crate::error::ProviderError;
use crate::{LLMClient, LLMParams, TARGET_LLM_REQUEST};

/// One merge call: a system instruction and the user prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub system: String,
    pub prompt: String,
}

/// A language model that turns a merge prompt into raw text.
///
/// Implementations classify their failures: anything worth retrying is
/// [`ProviderError::Transient`].
#[async_trait]
pub trait MergeProvider: Send + Sync {
    async fn complete(&self, request: &MergeRequest) -> Result<String, ProviderError>;
}

/// [`MergeProvider`] backed by Ollama or an OpenAI-compatible API.
pub struct LlmMergeProvider {
    params: LLMParams,
    timeout: Duration,
}

impl LlmMergeProvider {
    pub fn new(params: LLMParams, timeout: Duration) -> Self {
        Self { params, timeout }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self::new(build_llm_params(config)?, config.timeout))
    }

    pub fn describe(&self) -> String {
        match &self.params.llm_client {
            LLMClient::Ollama(_) => format!("Ollama ({})", self.params.model),
            LLMClient::OpenAI(_) => format!("OpenAI API ({})", self.params.model),
        }
    }
}

#[async_trait]
impl MergeProvider for LlmMergeProvider {
    async fn complete(&self, request: &MergeRequest) -> Result<String, ProviderError> {
        debug!(target: TARGET_LLM_REQUEST, "Sending merge request to {}: {}", self.describe(), request.prompt);

        let call = async {
            match &self.params.llm_client {
                LLMClient::Ollama(ollama) => generate_ollama(ollama, &self.params, request).await,
                LLMClient::OpenAI(client) => generate_openai(client, &self.params, request).await,
            }
        };

        match timeout(self.timeout, call).await {
            // Empty text is handed on; output validation treats it as malformed.
            Ok(Ok(text)) if text.trim().is_empty() => {
                warn!(target: TARGET_LLM_REQUEST, "Empty response from {}", self.describe());
                Ok(text)
            }
            Ok(Ok(text)) => {
                debug!(target: TARGET_LLM_REQUEST, "LLM response received: {}", text);
                Ok(text)
            }
            Ok(Err(e)) => {
                warn!(target: TARGET_LLM_REQUEST, "Error generating response: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(target: TARGET_LLM_REQUEST, "LLM request timed out after {:?}", self.timeout);
                Err(ProviderError::Transient(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

async fn generate_ollama(
    ollama: &Ollama,
    params: &LLMParams,
    request: &MergeRequest,
) -> Result<String, ProviderError> {
    let mut generation = GenerationRequest::new(params.model.clone(), request.prompt.clone());
    generation.system = Some(request.system.clone().into());
    generation.options = Some(GenerationOptions::default().temperature(params.temperature));

    ollama
        .generate(generation)
        .await
        .map(|response| response.response)
        .map_err(|e| classify_message(e.to_string()))
}

async fn generate_openai(
    client: &OpenAIClient<OpenAIConfig>,
    params: &LLMParams,
    request: &MergeRequest,
) -> Result<String, ProviderError> {
    let chat = CreateChatCompletionRequestArgs::default()
        .model(params.model.clone())
        .temperature(params.temperature)
        .response_format(ResponseFormat::JsonObject)
        .messages([
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system.clone())
                .build()
                .map_err(classify_openai)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(classify_openai)?
                .into(),
        ])
        .build()
        .map_err(classify_openai)?;

    let response = client.chat().create(chat).await.map_err(classify_openai)?;
    Ok(first_choice_text(response))
}

/// Text of the first choice. A reply without choices or content yields an
/// empty string, which fails output parsing like any other malformed reply.
fn first_choice_text(response: CreateChatCompletionResponse) -> String {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .unwrap_or_default()
}

fn classify_openai(error: OpenAIError) -> ProviderError {
    match error {
        OpenAIError::Reqwest(e) => ProviderError::Transient(e.to_string()),
        OpenAIError::JSONDeserialize(e) => ProviderError::Transient(e.to_string()),
        OpenAIError::ApiError(api) => {
            let kind = format!(
                "{} {}",
                api.r#type.clone().unwrap_or_default(),
                api.code.clone().unwrap_or_default()
            );
            if is_transient_text(&kind) || is_transient_text(&api.message) {
                ProviderError::Transient(api.message)
            } else {
                ProviderError::Permanent(api.message)
            }
        }
        other => ProviderError::Permanent(other.to_string()),
    }
}

fn classify_message(message: String) -> ProviderError {
    if is_transient_text(&message) {
        ProviderError::Transient(message)
    } else if message.to_lowercase().contains("not found") {
        ProviderError::Permanent(message)
    } else {
        // Ollama reports connection failures as plain text; assume they recover.
        ProviderError::Transient(message)
    }
}

fn is_transient_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    [
        "rate_limit",
        "rate limit",
        "server_error",
        "overloaded",
        "timeout",
        "timed out",
        "503",
        "502",
        "500",
        "429",
        "connection",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}

/// Builds the LLM client described by `config`.
pub fn build_llm_params(config: &LlmConfig) -> Result<LLMParams> {
    let llm_client = match config.llm_type {
        LlmType::OpenAI => {
            let api_key = config
                .openai_api_key
                .clone()
                .ok_or_else(|| anyhow!("OPENAI_API_KEY must be set when LLM_TYPE is openai"))?;
            let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
            if let Some(base) = &config.openai_base_url {
                openai_config = openai_config.with_api_base(base.clone());
            }
            info!(target: TARGET_LLM_REQUEST, "Using OpenAI-compatible API with model {}", config.model);
            LLMClient::OpenAI(OpenAIClient::with_config(openai_config))
        }
        LlmType::Ollama => {
            info!(target: TARGET_LLM_REQUEST, "Connecting to Ollama at {}:{}", config.ollama_host, config.ollama_port);
            LLMClient::Ollama(Ollama::new(config.ollama_host.clone(), config.ollama_port))
        }
    };

    Ok(LLMParams {
        llm_client,
        model: config.model.clone(),
        temperature: config.temperature,
    })
}
