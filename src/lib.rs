pub mod article;
pub mod clustering;
pub mod config;
pub mod db;
pub mod environment;
pub mod error;
pub mod inbox;
pub mod llm;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod repository;
pub mod similarity;

use async_openai::{config::OpenAIConfig, Client as OpenAIClient};
use ollama_rs::Ollama;

pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_PIPELINE: &str = "pipeline";
pub const TARGET_CLUSTER: &str = "clustering";

#[derive(Clone, Debug)]
pub enum LLMClient {
    Ollama(Ollama),
    OpenAI(OpenAIClient<OpenAIConfig>),
}

#[derive(Clone, Debug)]
pub struct LLMParams {
    pub llm_client: LLMClient,
    pub model: String,
    pub temperature: f32,
}

pub use article::{Article, RawArticle};
pub use clustering::{Cluster, ClusterId, ClusterStatus};
pub use merge::MergedArticle;
pub use pipeline::{Pipeline, RunSummary};
