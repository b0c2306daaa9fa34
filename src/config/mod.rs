use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue
    pub redis_url: String,

    /// AES-256-GCM encryption key for stored endpoint API keys
    /// (base64-encoded, 32 bytes)
    pub encryption_key: String,

    /// API key for the LLM judge; the judge runs degraded when absent
    pub judge_api_key: Option<String>,

    /// Base URL of the LLM judge provider
    #[serde(default = "default_judge_base_url")]
    pub judge_base_url: String,

    /// Ordered judge model fallback chain (comma-separated)
    #[serde(default = "default_judge_models")]
    pub judge_models: Vec<String>,

    /// Base URL of the statistical fairness service; skipped when absent
    pub fairness_service_url: Option<String>,

    /// Hard timeout for one fairness service call, seconds
    #[serde(default = "default_fairness_timeout_secs")]
    pub fairness_timeout_secs: u64,

    /// Minimum interval between per-item dispatches, milliseconds
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Fan-in wait budget per dispatched item, seconds
    #[serde(default = "default_fan_in_timeout_secs_per_item")]
    pub fan_in_timeout_secs_per_item: u64,

    /// Minimum fan-in wait regardless of item count, seconds
    #[serde(default = "default_fan_in_timeout_floor_secs")]
    pub fan_in_timeout_floor_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_judge_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_judge_models() -> Vec<String> {
    vec![
        "gemini-2.0-flash".to_string(),
        "gemini-1.5-flash".to_string(),
        "gemini-1.5-pro".to_string(),
    ]
}

fn default_fairness_timeout_secs() -> u64 {
    20
}

fn default_dispatch_interval_ms() -> u64 {
    1000
}

fn default_fan_in_timeout_secs_per_item() -> u64 {
    60
}

fn default_fan_in_timeout_floor_secs() -> u64 {
    120
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
