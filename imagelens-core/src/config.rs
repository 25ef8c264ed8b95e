use crate::core::color::SIMILARITY_THRESHOLD;
use crate::core::vision::{DEFAULT_VISION_BASE_URL, DEFAULT_VISION_MODEL};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SIMILAR_LIMIT: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub storage_dir: PathBuf,
    pub public_base_url: String,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub vision_base_url: String,
    pub vision_model: String,
    pub vision_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub similar_limit: usize,
    pub color_threshold: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl AppConfig {
    /// Defaults with every path placed under `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let storage_dir = data_dir.join("objects");
        Self {
            database_path: data_dir.join("imagelens.db"),
            public_base_url: format!("file://{}", storage_dir.display()),
            storage_dir,
            data_dir,
            openai_api_key: None,
            vision_base_url: DEFAULT_VISION_BASE_URL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            vision_timeout_secs: 30,
            store_timeout_secs: 60,
            similar_limit: DEFAULT_SIMILAR_LIMIT,
            color_threshold: SIMILARITY_THRESHOLD,
        }
    }

    /// Move the database and object store under `data_dir`, keeping every other setting.
    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        let relocated = Self::with_data_dir(data_dir);
        self.database_path = relocated.database_path;
        self.storage_dir = relocated.storage_dir;
        self.public_base_url = relocated.public_base_url;
        self.data_dir = relocated.data_dir;
    }

    /// A remote vision model cannot fetch `file://` URLs, so model calls would
    /// all end in the fallback.
    pub fn objects_unreachable_by_model(&self) -> bool {
        self.openai_api_key.is_some() && self.public_base_url.starts_with("file://")
    }

    /// Defaults overlaid with `IMAGELENS_*` and `OPENAI_API_KEY` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut config = match value("IMAGELENS_DATA_DIR") {
            Some(dir) => Self::with_data_dir(PathBuf::from(dir)),
            None => Self::default(),
        };

        if let Some(path) = value("IMAGELENS_DATABASE") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(dir) = value("IMAGELENS_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
            config.public_base_url = format!("file://{}", config.storage_dir.display());
        }
        if let Some(url) = value("IMAGELENS_PUBLIC_URL") {
            config.public_base_url = url;
        }
        config.openai_api_key = value("OPENAI_API_KEY");
        if let Some(url) = value("IMAGELENS_VISION_URL") {
            config.vision_base_url = url;
        }
        if let Some(model) = value("IMAGELENS_VISION_MODEL") {
            config.vision_model = model;
        }
        config.vision_timeout_secs = parse_or(
            value("IMAGELENS_VISION_TIMEOUT_SECS"),
            config.vision_timeout_secs,
        );
        config.store_timeout_secs = parse_or(
            value("IMAGELENS_STORE_TIMEOUT_SECS"),
            config.store_timeout_secs,
        );

        config
    }

    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("Documents").join("ImageLens"))
        .unwrap_or_else(|| std::env::temp_dir().join("imagelens"))
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}
