use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ParleyError, Result};

/// Top-level configuration for the Parley assistant backend.
///
/// Loaded from `~/.parley/config.toml` by default. Each section corresponds
/// to one part of the turn pipeline or a cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ParleyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ParleyConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the turn pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chat.max_stored_messages == 0 {
            return Err(ParleyError::Config(
                "chat.max_stored_messages must be at least 1".to_string(),
            ));
        }
        if self.chat.prompt_history > self.chat.max_stored_messages {
            return Err(ParleyError::Config(format!(
                "chat.prompt_history ({}) exceeds chat.max_stored_messages ({})",
                self.chat.prompt_history, self.chat.max_stored_messages
            )));
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(ParleyError::Config(format!(
                "chat.temperature must be within [0, 2], got {}",
                self.chat.temperature
            )));
        }
        if self.chat.session_idle_secs == 0 {
            return Err(ParleyError::Config(
                "chat.session_idle_secs must be at least 1".to_string(),
            ));
        }
        if self.enrichment.max_text_preview_chars == 0 {
            return Err(ParleyError::Config(
                "enrichment.max_text_preview_chars must be at least 1".to_string(),
            ));
        }
        if self.enrichment.lookup_timeout_secs == Some(0) {
            return Err(ParleyError::Config(
                "enrichment.lookup_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.general.data_dir).join(&self.storage.database_file)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.parley/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Conversation and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Rolling window of messages retained per conversation.
    pub max_stored_messages: usize,
    /// Most recent messages forwarded to the generation call.
    pub prompt_history: usize,
    /// Token ceiling for each generated reply.
    pub max_tokens: u32,
    /// Sampling temperature for generation.
    pub temperature: f32,
    /// Characters of the user message kept as the sidebar preview.
    pub preview_chars: usize,
    /// Create a directory entry for sessions that do not have one yet.
    pub auto_register_sessions: bool,
    /// Seconds without requests before a conversation's worker is retired.
    pub session_idle_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_stored_messages: 50,
            prompt_history: 10,
            max_tokens: 2048,
            temperature: 0.7,
            preview_chars: 100,
            auto_register_sessions: true,
            session_idle_secs: 300,
        }
    }
}

/// Attachment extraction and side-lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Maximum characters of a text file forwarded into the prompt.
    pub max_text_preview_chars: usize,
    /// Minimum alphanumeric characters a PDF must yield to count as readable.
    pub pdf_min_readable_chars: usize,
    /// City used for weather lookups when the message names none.
    pub default_city: String,
    /// Optional per-lookup timeout. Unset means lookups may take as long as
    /// they need.
    pub lookup_timeout_secs: Option<u64>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            max_text_preview_chars: 10_000,
            pdf_min_readable_chars: 50,
            default_city: "London".to_string(),
            lookup_timeout_secs: None,
        }
    }
}

/// Remote model and lookup endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model used for reply generation.
    pub text_model: String,
    /// Model used for image understanding.
    pub vision_model: String,
    /// Weather endpoint; `{city}` is replaced by the URL-encoded city.
    pub weather_url: String,
    /// News/search endpoint; `{query}` is replaced by the URL-encoded query.
    pub news_url: String,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "PARLEY_API_KEY".to_string(),
            text_model: "gpt-4o-mini".to_string(),
            vision_model: "gpt-4o-mini".to_string(),
            weather_url: "https://wttr.in/{city}?format=%l:+%C,+%t,+humidity+%h,+wind+%w"
                .to_string(),
            news_url:
                "https://api.duckduckgo.com/?q={query}&format=json&no_html=1&skip_disambig=1"
                    .to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file name, relative to `general.data_dir`.
    pub database_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: "parley.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = ParleyConfig::default();
        assert_eq!(config.general.data_dir, "~/.parley/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.chat.max_stored_messages, 50);
        assert_eq!(config.chat.prompt_history, 10);
        assert_eq!(config.enrichment.pdf_min_readable_chars, 50);
        assert!(config.enrichment.lookup_timeout_secs.is_none());
        assert_eq!(config.chat.session_idle_secs, 300);
        assert_eq!(config.storage.database_file, "parley.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/custom/data"
log_level = "debug"

[chat]
max_stored_messages = 20
prompt_history = 4
temperature = 0.2

[enrichment]
default_city = "Paris"
lookup_timeout_secs = 5
"#;
        let file = create_temp_config(content);
        let config = ParleyConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/custom/data");
        assert_eq!(config.chat.max_stored_messages, 20);
        assert_eq!(config.chat.prompt_history, 4);
        assert_eq!(config.enrichment.default_city, "Paris");
        assert_eq!(config.enrichment.lookup_timeout_secs, Some(5));
        // Unspecified fields keep their defaults.
        assert_eq!(config.chat.max_tokens, 2048);
    }

    #[test]
    fn test_load_rejects_history_larger_than_window() {
        let content = r#"
[chat]
max_stored_messages = 5
prompt_history = 10
"#;
        let file = create_temp_config(content);
        let err = ParleyConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ParleyError::Config(_)));
        assert!(err.to_string().contains("prompt_history"));
    }

    #[test]
    fn test_validate_rejects_bad_temperature() {
        let mut config = ParleyConfig::default();
        config.chat.temperature = 3.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_window() {
        let mut config = ParleyConfig::default();
        config.chat.max_stored_messages = 0;
        config.chat.prompt_history = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = ParleyConfig::default();
        config.enrichment.lookup_timeout_secs = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lookup_timeout_secs"));

        config.enrichment.lookup_timeout_secs = Some(1);
        assert!(config.validate().is_ok());

        config.chat.session_idle_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = ParleyConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.parley/data");
    }

    #[test]
    fn test_load_malformed_toml() {
        let file = create_temp_config("[chat\nmax_tokens = ");
        assert!(matches!(
            ParleyConfig::load(file.path()),
            Err(ParleyError::Config(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ParleyConfig::default();
        config.enrichment.lookup_timeout_secs = Some(3);
        config.save(&path).unwrap();

        let reloaded = ParleyConfig::load(&path).unwrap();
        assert_eq!(reloaded.chat.preview_chars, config.chat.preview_chars);
        assert_eq!(reloaded.enrichment.lookup_timeout_secs, Some(3));
        assert_eq!(reloaded.providers.text_model, config.providers.text_model);
    }

    #[test]
    fn test_database_path_joins_data_dir() {
        let mut config = ParleyConfig::default();
        config.general.data_dir = "/var/lib/parley".to_string();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/parley/parley.db")
        );
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
        assert!(!expand_home("~/data").to_string_lossy().starts_with('~'));
    }
}
