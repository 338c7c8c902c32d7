use crate::error::{ProxyError, Result};
use crate::providers::ProviderPreset;
use crate::translate::Format;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Forward bodies untouched when the routed provider speaks the client's format.
    #[serde(default)]
    pub direct_mode: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_cooldown")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultRoute>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultRoute {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_true")]
    pub supports_tools: bool,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,
    /// Header carrying the credential; vendor default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    /// Header value template with an `{api_key}` or `{key}` placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub route_key: String,
    pub provider: String,
    pub target_model: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Key id to use first for this route; rotation still applies on 429.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    4222
}

fn default_request_timeout() -> u64 {
    300
}

fn default_stream_idle_timeout() -> u64 {
    120
}

fn default_max_attempts() -> usize {
    4
}

fn default_cooldown() -> u64 {
    60
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("llm-relay-audit.jsonl")
}

fn default_true() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            direct_mode: false,
            request_timeout_secs: default_request_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            max_attempts: default_max_attempts(),
            rate_limit_cooldown_secs: default_cooldown(),
            audit_log: default_audit_log(),
            default: None,
            providers: BTreeMap::new(),
            routes: Vec::new(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            format: None,
            base_url: None,
            supports_tools: true,
            keys: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(ProxyError::config(format!(
            "No config file found. Searched: {}. Create one from config.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Check cross references: routes and the default name configured
    /// providers, and every provider can be reached and authenticated.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ProxyError::config("max_attempts must be at least 1"));
        }

        for name in self.providers.keys() {
            self.provider_format(name)?;
            self.provider_base_url(name)?;
            if self.provider_keys(name).is_empty() {
                return Err(ProxyError::config(format!(
                    "provider '{name}' has no keys configured"
                )));
            }
        }

        for route in &self.routes {
            if route.route_key.trim().is_empty() {
                return Err(ProxyError::config(format!(
                    "a route to provider '{}' has an empty route_key",
                    route.provider
                )));
            }
            if !self.providers.contains_key(&route.provider) {
                return Err(ProxyError::config(format!(
                    "route '{}' points at unknown provider '{}'",
                    route.route_key, route.provider
                )));
            }
            if let Some(ref credential) = route.credential {
                let known = self
                    .provider_keys(&route.provider)
                    .iter()
                    .enumerate()
                    .any(|(i, key)| key.id_or_default(&route.provider, i) == *credential);
                if !known {
                    return Err(ProxyError::config(format!(
                        "route '{}' pins unknown key '{}' of provider '{}'",
                        route.route_key, credential, route.provider
                    )));
                }
            }
        }

        if let Some(ref default) = self.default {
            if !self.providers.contains_key(&default.provider) {
                return Err(ProxyError::config(format!(
                    "default provider '{}' is not configured",
                    default.provider
                )));
            }
        }

        Ok(())
    }

    /// Wire format of a configured provider (explicit or from its preset).
    pub fn provider_format(&self, name: &str) -> Result<Format> {
        if let Some(format) = self.providers.get(name).and_then(|p| p.format) {
            return Ok(format);
        }
        ProviderPreset::from_name(name)
            .map(|p| p.format)
            .ok_or_else(|| {
                ProxyError::config(format!(
                    "Unknown provider '{name}' and no format configured. Known providers: {}",
                    known_presets()
                ))
            })
    }

    /// Resolve the effective base URL (config override or provider preset default)
    pub fn provider_base_url(&self, name: &str) -> Result<String> {
        if let Some(url) = self.providers.get(name).and_then(|p| p.base_url.clone()) {
            return Ok(url);
        }
        ProviderPreset::from_name(name)
            .map(|p| p.base_url.to_string())
            .ok_or_else(|| {
                ProxyError::config(format!(
                    "Unknown provider '{name}' and no base_url configured. Known providers: {}",
                    known_presets()
                ))
            })
    }

    pub fn provider_supports_tools(&self, name: &str) -> bool {
        self.providers.get(name).map_or(true, |p| p.supports_tools)
    }

    /// Configured keys, or the preset's API key variable when none are listed.
    pub fn provider_keys(&self, name: &str) -> Vec<KeyConfig> {
        let keys = self
            .providers
            .get(name)
            .map(|p| p.keys.clone())
            .unwrap_or_default();
        if !keys.is_empty() {
            return keys;
        }
        ProviderPreset::from_name(name)
            .map(|p| {
                vec![KeyConfig {
                    key_env: Some(p.default_api_key_env.to_string()),
                    ..KeyConfig::default()
                }]
            })
            .unwrap_or_default()
    }
}

impl KeyConfig {
    /// Configured id, or `{provider}-{n}` counting from 1.
    pub fn id_or_default(&self, provider: &str, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{provider}-{}", index + 1))
    }

    /// The secret itself, read from `key` or the `key_env` variable.
    pub fn resolve_secret(&self) -> Result<String> {
        if let Some(ref key) = self.key {
            return Ok(key.clone());
        }
        match self.key_env {
            Some(ref var) => std::env::var(var).map_err(|_| {
                ProxyError::config(format!(
                    "Environment variable '{var}' not set. Set it with your provider API key."
                ))
            }),
            None => Err(ProxyError::config("key entry needs either `key` or `key_env`")),
        }
    }
}

fn known_presets() -> String {
    ProviderPreset::all()
        .iter()
        .map(|p| p.name)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("llm-relay.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("llm-relay").join("config.toml"));
    }
    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join("llm-relay").join("config.toml"));
        // Home directory fallback
        paths.push(home.join(".llm-relay.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
port = 5000
direct_mode = true
max_attempts = 3

[default]
provider = "openai"
model = "gpt-4o-mini"

[providers.openai]
[[providers.openai.keys]]
id = "primary"
key = "sk-one"
[[providers.openai.keys]]
key = "sk-two"

[providers.local]
format = "anthropic"
base_url = "http://localhost:9000"
supports_tools = false
[[providers.local.keys]]
key = "local-key"
auth_header = "Authorization"
auth_format = "Bearer {api_key}"

[[routes]]
route_key = "claude-3-opus-20240229"
provider = "local"
target_model = "claude-3-opus"
keywords = ["translate"]
"#;

    fn write_config(text: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{}", text).unwrap();
        f
    }

    #[test]
    fn test_load_config() {
        let f = write_config(SAMPLE);
        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert!(config.direct_mode);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.stream_idle_timeout_secs, 120);
        assert_eq!(config.providers["openai"].keys.len(), 2);
        assert_eq!(config.routes[0].keywords, vec!["translate"]);
        assert!(config.routes[0].enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_provider_resolution() {
        let f = write_config(SAMPLE);
        let config = ProxyConfig::load(f.path()).unwrap();

        assert_eq!(config.provider_format("openai").unwrap(), Format::OpenAi);
        assert_eq!(
            config.provider_base_url("openai").unwrap(),
            "https://api.openai.com/v1"
        );
        assert_eq!(config.provider_format("local").unwrap(), Format::Claude);
        assert_eq!(
            config.provider_base_url("local").unwrap(),
            "http://localhost:9000"
        );
        assert!(!config.provider_supports_tools("local"));
    }

    #[test]
    fn test_validate_rejects_dangling_route() {
        let f = write_config(
            r#"
[providers.openai]
[[providers.openai.keys]]
key = "sk"

[[routes]]
route_key = "fast"
provider = "groq"
target_model = "llama"
"#,
        );
        let config = ProxyConfig::load(f.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown provider 'groq'"));
    }

    #[test]
    fn test_validate_route_credential_and_key() {
        let base = r#"
[providers.openai]
[[providers.openai.keys]]
key = "sk-a"
[[providers.openai.keys]]
id = "batch"
key = "sk-b"
"#;
        let parse = |routes: &str| -> ProxyConfig {
            toml::from_str(&format!("{base}{routes}")).unwrap()
        };

        let ok = parse("[[routes]]\nroute_key = \"cheap\"\nprovider = \"openai\"\ntarget_model = \"m\"\ncredential = \"batch\"\n");
        ok.validate().unwrap();
        assert_eq!(ok.routes[0].credential.as_deref(), Some("batch"));

        let default_id = parse("[[routes]]\nroute_key = \"cheap\"\nprovider = \"openai\"\ntarget_model = \"m\"\ncredential = \"openai-1\"\n");
        default_id.validate().unwrap();

        let unknown = parse("[[routes]]\nroute_key = \"cheap\"\nprovider = \"openai\"\ntarget_model = \"m\"\ncredential = \"nope\"\n");
        assert!(unknown.validate().unwrap_err().to_string().contains("unknown key 'nope'"));

        let empty = parse("[[routes]]\nroute_key = \"\"\nprovider = \"openai\"\ntarget_model = \"m\"\n");
        assert!(empty.validate().unwrap_err().to_string().contains("empty route_key"));
    }

    #[test]
    fn test_unknown_provider_without_base_url() {
        let mut config = ProxyConfig::default();
        config.providers.insert(
            "custom".to_string(),
            ProviderConfig {
                format: Some(Format::OpenAi),
                keys: vec![KeyConfig {
                    key: Some("k".to_string()),
                    ..KeyConfig::default()
                }],
                ..ProviderConfig::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preset_key_env_fallback() {
        let mut config = ProxyConfig::default();
        config
            .providers
            .insert("deepseek".to_string(), ProviderConfig::default());
        let keys = config.provider_keys("deepseek");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_env.as_deref(), Some("DEEPSEEK_API_KEY"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: ProxyConfig =
            toml::from_str(include_str!("../config.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.provider_format("local").unwrap(), Format::OpenAi);
        assert_eq!(config.provider_keys("openai")[0].key_env.as_deref(), Some("OPENAI_API_KEY"));
        assert!(!config.routes[2].enabled);
    }
}
