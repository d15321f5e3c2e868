//! TOML configuration parsing and validation.
//!
//! The engine consumes (but does not own) a single configuration file.
//! Secrets are never stored in the file; each section names the
//! environment variable holding its credential.
//!
//! ```toml
//! [db]
//! path = "./data/similar.sqlite"
//!
//! [embedding]
//! base_url = "https://api.openai.com/v1"
//! model = "text-embedding-3-small"
//! dims = 1536
//! max_tokens = 8000
//!
//! [vector_store]
//! backend = "qdrant"            # sqlite | qdrant | pinecone
//! collection = "similar_issues"
//!
//! [vector_store.qdrant]
//! url = "http://localhost:6333"
//!
//! [retrieval]
//! top_k = 5
//! score = "unit"                # raw | unit
//!
//! [index]
//! include_comments = true
//!
//! [issue_provider]
//! provider = "github"           # github | gitlab | jira
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub issue_provider: IssueProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Inputs are truncated to this many tokens before embedding.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Texts per HTTP request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Requests in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    /// Defaults to `true` when `base_url` points at the OpenAI API.
    #[serde(default)]
    pub require_api_key: Option<bool>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_url(),
            model: default_embedding_model(),
            dims: default_dims(),
            max_tokens: default_max_tokens(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_base_ms: default_retry_base_ms(),
            api_key_env: default_embedding_key_env(),
            require_api_key: None,
        }
    }
}

impl EmbeddingConfig {
    /// Bearer credential from the configured environment variable, if set.
    pub fn api_key(&self) -> Option<String> {
        read_secret(&self.api_key_env)
    }

    pub fn requires_api_key(&self) -> bool {
        self.require_api_key
            .unwrap_or_else(|| self.base_url.contains("api.openai.com"))
    }
}

fn default_embedding_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_max_tokens() -> usize {
    8000
}
fn default_batch_size() -> usize {
    64
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

// ============ Vector store ============

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default)]
    pub qdrant: Option<QdrantConfig>,
    #[serde(default)]
    pub pinecone: Option<PineconeConfig>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            collection: default_collection(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_base_ms: default_retry_base_ms(),
            qdrant: None,
            pinecone: None,
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_collection() -> String {
    "similar_issues".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            api_key_env: None,
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PineconeConfig {
    #[serde(default = "default_pinecone_control_url")]
    pub control_url: String,
    #[serde(default = "default_pinecone_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_pinecone_cloud")]
    pub cloud: String,
    #[serde(default = "default_pinecone_region")]
    pub region: String,
}

impl Default for PineconeConfig {
    fn default() -> Self {
        Self {
            control_url: default_pinecone_control_url(),
            api_key_env: default_pinecone_key_env(),
            cloud: default_pinecone_cloud(),
            region: default_pinecone_region(),
        }
    }
}

fn default_pinecone_control_url() -> String {
    "https://api.pinecone.io".to_string()
}
fn default_pinecone_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}
fn default_pinecone_cloud() -> String {
    "aws".to_string()
}
fn default_pinecone_region() -> String {
    "us-east-1".to_string()
}

// ============ Retrieval ============

/// How backend cosine similarity is reported to callers.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMode {
    /// Native cosine similarity in `[-1, 1]`.
    Raw,
    /// Cosine similarity mapped to `[0, 1]`.
    #[default]
    Unit,
}

impl ScoreMode {
    pub fn apply(&self, cosine: f32) -> f32 {
        match self {
            ScoreMode::Raw => cosine,
            ScoreMode::Unit => ((cosine + 1.0) / 2.0).clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score: ScoreMode,
    /// Hits scoring below this (after normalization) are dropped.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score: ScoreMode::default(),
            min_score: None,
        }
    }
}

fn default_top_k() -> usize {
    5
}

// ============ Indexing ============

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub include_comments: bool,
    /// Issues per committed batch.
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub force_rebuild: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            include_comments: false,
            batch_size: default_index_batch_size(),
            force_rebuild: false,
        }
    }
}

fn default_index_batch_size() -> usize {
    32
}

// ============ Issue provider ============

#[derive(Debug, Deserialize, Clone)]
pub struct IssueProviderConfig {
    #[serde(default = "default_issue_provider")]
    pub provider: String,
    #[serde(default)]
    pub github: Option<GitHubConfig>,
    #[serde(default)]
    pub gitlab: Option<GitLabConfig>,
    #[serde(default)]
    pub jira: Option<JiraConfig>,
}

impl Default for IssueProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_issue_provider(),
            github: None,
            gitlab: None,
            jira: None,
        }
    }
}

fn default_issue_provider() -> String {
    "github".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    #[serde(default = "default_github_url")]
    pub api_url: String,
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_url(),
            token_env: default_github_token_env(),
        }
    }
}

fn default_github_url() -> String {
    "https://api.github.com".to_string()
}
fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitLabConfig {
    #[serde(default = "default_gitlab_url")]
    pub api_url: String,
    #[serde(default = "default_gitlab_token_env")]
    pub token_env: String,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            api_url: default_gitlab_url(),
            token_env: default_gitlab_token_env(),
        }
    }
}

fn default_gitlab_url() -> String {
    "https://gitlab.com/api/v4".to_string()
}
fn default_gitlab_token_env() -> String {
    "GITLAB_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraConfig {
    pub base_url: String,
    #[serde(default)]
    pub project_key: Option<String>,
    /// Extra JQL ANDed onto the project scope.
    #[serde(default)]
    pub jql: Option<String>,
    #[serde(default = "default_jira_email_env")]
    pub email_env: String,
    #[serde(default = "default_jira_token_env")]
    pub token_env: String,
}

fn default_jira_email_env() -> String {
    "JIRA_EMAIL".to_string()
}
fn default_jira_token_env() -> String {
    "JIRA_API_TOKEN".to_string()
}

/// Read a non-empty secret from the environment.
pub fn read_secret(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate embedding
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.max_tokens == 0 {
        bail!("embedding.max_tokens must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_concurrency == 0 {
        bail!("embedding.max_concurrency must be > 0");
    }
    if config.embedding.model.trim().is_empty() {
        bail!("embedding.model must not be empty");
    }

    // Validate vector store
    match config.vector_store.backend.as_str() {
        "sqlite" | "qdrant" | "pinecone" => {}
        other => bail!(
            "Unknown vector_store.backend: '{}'. Must be sqlite, qdrant, or pinecone.",
            other
        ),
    }
    if config.vector_store.collection.trim().is_empty() {
        bail!("vector_store.collection must not be empty");
    }

    // Validate retrieval and indexing
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.index.batch_size == 0 {
        bail!("index.batch_size must be > 0");
    }

    // Validate issue provider
    match config.issue_provider.provider.as_str() {
        "github" | "gitlab" => {}
        "jira" => {
            if config.issue_provider.jira.is_none() {
                bail!("issue_provider.provider = 'jira' requires an [issue_provider.jira] section");
            }
        }
        other => bail!(
            "Unknown issue_provider.provider: '{}'. Must be github, gitlab, or jira.",
            other
        ),
    }

    Ok(config)
}
