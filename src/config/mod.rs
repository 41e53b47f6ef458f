use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the persisted job-state blob
    pub redis_url: String,

    /// Base URL of the target image-to-video site
    #[serde(default = "default_target_url")]
    pub target_url: String,

    /// S3-compatible bucket holding the image payload cache
    pub store_bucket: String,

    /// Access key ID for the image store
    pub store_access_key: String,

    /// Secret access key for the image store
    pub store_secret_key: String,

    /// Endpoint URL for the image store
    pub store_endpoint: String,

    /// Directory that finished videos are written to
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Watchdog window per item, in seconds
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,

    /// Generation polling budget per video, in seconds
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_target_url() -> String {
    "https://grok.com/imagine/".to_string()
}

fn default_download_dir() -> String {
    "downloads".to_string()
}

fn default_watchdog_secs() -> u64 {
    120
}

fn default_generation_timeout_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
