use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Project-local config, checked before the user config
const LOCAL_CONFIG_PATH: &str = "./instruct.toml";
/// Legacy dotfile, checked after the user config
const LEGACY_CONFIG_PATH: &str = "~/.instruct.toml";

/// Environment variable consulted when a hosted config has no API key
pub const HOSTED_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
/// Environment variable consulted when a local config has no auth token
pub const LOCAL_AUTH_TOKEN_ENV: &str = "HUGGINGFACE_API_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub providers: ProvidersConfig,
}

/// Provider configuration with named configs per provider type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Default provider in format "<provider_type>.<config_name>"
    pub default_provider: String,

    /// Named hosted API provider configs
    #[serde(default)]
    pub hosted: HashMap<String, HostedConfig>,

    /// Named local pipeline provider configs
    #[serde(default)]
    pub local: HashMap<String, LocalConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Unrecognized keys, kept so older and newer files still load
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl HostedConfig {
    /// The configured API key, or the environment's when none is configured.
    pub fn resolved_api_key(&self) -> String {
        resolve_secret(
            Some(self.api_key.as_str()),
            std::env::var(HOSTED_API_KEY_ENV).ok(),
        )
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub model_path: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub auth_token: Option<String>,
    /// Single-device placement, e.g. "cpu" or "cuda:0"
    pub device: Option<String>,
    /// "auto" or a backend-specific placement
    pub device_map: Option<String>,
    /// bfloat16, float16 or float32
    pub precision: Option<String>,
    pub load_in_8bit: Option<bool>,
    /// Backend-specific options passed through to the loader
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl LocalConfig {
    /// The configured auth token, or the environment's when none is configured.
    pub fn resolved_auth_token(&self) -> Option<String> {
        resolve_secret(
            self.auth_token.as_deref(),
            std::env::var(LOCAL_AUTH_TOKEN_ENV).ok(),
        )
    }
}

/// Pick a configured secret, falling back to an environment value.
/// Empty strings count as unset.
pub fn resolve_secret(configured: Option<&str>, env_value: Option<String>) -> Option<String> {
    configured
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| env_value.filter(|s| !s.is_empty()))
}

impl Default for Config {
    fn default() -> Self {
        let mut hosted = HashMap::new();
        hosted.insert(
            "default".to_string(),
            HostedConfig {
                api_key: String::new(),
                model: Some("claude-2".to_string()),
                max_tokens: Some(75000),
                temperature: Some(0.7),
                extra: HashMap::new(),
            },
        );

        let mut local = HashMap::new();
        local.insert(
            "default".to_string(),
            LocalConfig {
                model_path: "HuggingFaceH4/starchat-beta".to_string(),
                model: Some("starchat".to_string()),
                temperature: Some(0.7),
                max_tokens: Some(1024),
                auth_token: None,
                device: None,
                device_map: None,
                precision: None,
                load_in_8bit: None,
                options: HashMap::new(),
            },
        );

        Self {
            providers: ProvidersConfig {
                default_provider: "hosted.default".to_string(),
                hosted,
                local,
            },
        }
    }
}

impl Config {
    /// Load configuration from `config_path`, or from the first default
    /// location that exists. Without any file the defaults are returned;
    /// nothing is written to disk.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path_to_load = match config_path {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    anyhow::bail!("Config file not found: {}", expanded);
                }
                Some(expanded)
            }
            None => Self::find_default_path(),
        };

        let Some(path) = path_to_load else {
            debug!("No config file found, using defaults");
            return Ok(Self::default());
        };

        debug!("Loading config from {}", path);
        let config_content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file {}", path))?;

        config.validate_provider_reference(&config.providers.default_provider)?;

        Ok(config)
    }

    /// Locations searched when no config path is given, in order
    pub fn default_search_paths() -> Vec<String> {
        vec![
            LOCAL_CONFIG_PATH.to_string(),
            Self::user_config_path().to_string_lossy().into_owned(),
            shellexpand::tilde(LEGACY_CONFIG_PATH).into_owned(),
        ]
    }

    /// First existing file among the default locations
    pub fn find_default_path() -> Option<String> {
        Self::default_search_paths()
            .into_iter()
            .find(|path| Path::new(path).exists())
    }

    /// Default location for a user-level config file
    pub fn user_config_path() -> std::path::PathBuf {
        dirs::home_dir()
            .map(|mut path| {
                path.push(".config");
                path.push("instruct");
                path.push("config.toml");
                path
            })
            .unwrap_or_else(|| std::path::PathBuf::from("./instruct.toml"))
    }

    /// Validate a provider reference (format: "<provider_type>.<config_name>")
    pub fn validate_provider_reference(&self, reference: &str) -> Result<()> {
        let (provider_type, config_name) = Self::parse_provider_reference(reference)?;

        match provider_type.as_str() {
            "hosted" => {
                if !self.providers.hosted.contains_key(&config_name) {
                    anyhow::bail!(
                        "Provider config 'hosted.{}' not found. Available: {:?}",
                        config_name,
                        sorted_keys(&self.providers.hosted)
                    );
                }
            }
            "local" => {
                if !self.providers.local.contains_key(&config_name) {
                    anyhow::bail!(
                        "Provider config 'local.{}' not found. Available: {:?}",
                        config_name,
                        sorted_keys(&self.providers.local)
                    );
                }
            }
            _ => {
                anyhow::bail!(
                    "Unknown provider type '{}'. Valid types: hosted, local",
                    provider_type
                );
            }
        }

        Ok(())
    }

    /// Parse a provider reference into (provider_type, config_name)
    pub fn parse_provider_reference(reference: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = reference.split('.').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
            anyhow::bail!(
                "Invalid provider reference '{}'. Expected format: '<provider_type>.<config_name>'",
                reference
            );
        }
        Ok((parts[0].to_string(), parts[1].to_string()))
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn load_with_overrides(
        config_path: Option<&str>,
        provider_override: Option<String>,
        model_override: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path)?;

        if let Some(provider) = provider_override {
            config.validate_provider_reference(&provider)?;
            config.providers.default_provider = provider;
        }

        // Apply model override to the active provider
        if let Some(model) = model_override {
            let (provider_type, config_name) =
                Self::parse_provider_reference(&config.providers.default_provider)?;

            match provider_type.as_str() {
                "hosted" => {
                    let hosted_config = config
                        .providers
                        .hosted
                        .get_mut(&config_name)
                        .ok_or_else(|| {
                            anyhow::anyhow!("Provider config 'hosted.{}' not found.", config_name)
                        })?;
                    hosted_config.model = Some(model);
                }
                "local" => {
                    let local_config = config
                        .providers
                        .local
                        .get_mut(&config_name)
                        .ok_or_else(|| {
                            anyhow::anyhow!("Provider config 'local.{}' not found.", config_name)
                        })?;
                    local_config.model_path = model;
                }
                _ => anyhow::bail!("Unknown provider type: {}", provider_type),
            }
        }

        Ok(config)
    }

    /// Get hosted config by name
    pub fn get_hosted_config(&self, name: &str) -> Option<&HostedConfig> {
        self.providers.hosted.get(name)
    }

    /// Get local config by name
    pub fn get_local_config(&self, name: &str) -> Option<&LocalConfig> {
        self.providers.local.get(name)
    }

    /// Get the current default provider's config
    pub fn get_default_provider_config(&self) -> Result<ProviderConfigRef<'_>> {
        self.get_provider_config(&self.providers.default_provider)
    }

    pub fn get_provider_config(&self, reference: &str) -> Result<ProviderConfigRef<'_>> {
        let (provider_type, config_name) = Self::parse_provider_reference(reference)?;

        match provider_type.as_str() {
            "hosted" => self
                .get_hosted_config(&config_name)
                .map(ProviderConfigRef::Hosted)
                .ok_or_else(|| anyhow::anyhow!("Hosted config '{}' not found", config_name)),
            "local" => self
                .get_local_config(&config_name)
                .map(ProviderConfigRef::Local)
                .ok_or_else(|| anyhow::anyhow!("Local config '{}' not found", config_name)),
            _ => Err(anyhow::anyhow!("Unknown provider type: {}", provider_type)),
        }
    }

    /// Every configured provider reference, sorted
    pub fn provider_references(&self) -> Vec<String> {
        let mut references: Vec<String> = self
            .providers
            .hosted
            .keys()
            .map(|name| format!("hosted.{}", name))
            .chain(
                self.providers
                    .local
                    .keys()
                    .map(|name| format!("local.{}", name)),
            )
            .collect();
        references.sort();
        references
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<&str> {
    let mut keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
    keys.sort_unstable();
    keys
}

/// Reference to a provider configuration
#[derive(Debug)]
pub enum ProviderConfigRef<'a> {
    Hosted(&'a HostedConfig),
    Local(&'a LocalConfig),
}
