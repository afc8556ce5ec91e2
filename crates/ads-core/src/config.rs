// Injected configuration
// Environment variables are read once at startup into a validated struct;
// everything downstream takes the struct. The feature-flag helpers are pure
// functions over it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct AdsConfig {
    pub codex_bin: String,
    pub amp_bin: Option<String>,
    pub claude_bin: Option<String>,
    pub gemini_bin: Option<String>,
    pub droid_bin: Option<String>,
    pub probe_timeout_ms: u64,
    pub coordinator_enabled: bool,
    pub verification_enabled: bool,
    pub exec_tool_enabled: bool,
    pub claude_enabled: bool,
    pub gemini_enabled: bool,
    pub claude_api_key: Option<String>,
    pub claude_model: String,
    pub claude_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_use_vertex: bool,
    pub verification_allowlist: Vec<String>,
    pub session_timeout_ms: i64,
}

impl Default for AdsConfig {
    fn default() -> Self {
        Self {
            codex_bin: "codex".to_string(),
            amp_bin: None,
            claude_bin: None,
            gemini_bin: None,
            droid_bin: None,
            probe_timeout_ms: 3_000,
            coordinator_enabled: true,
            verification_enabled: true,
            exec_tool_enabled: true,
            claude_enabled: true,
            gemini_enabled: true,
            claude_api_key: None,
            claude_model: "claude-sonnet-4-20250514".to_string(),
            claude_base_url: "https://api.anthropic.com".to_string(),
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_use_vertex: false,
            verification_allowlist: Vec::new(),
            session_timeout_ms: 30 * 60 * 1000,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl AdsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup; tests
    /// inject maps instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let parse_u64 = |key: &str, fallback: u64| -> Result<u64, ConfigError> {
            match non_empty(lookup(key)) {
                Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                }),
                None => Ok(fallback),
            }
        };
        let parse_i64 = |key: &str, fallback: i64| -> Result<i64, ConfigError> {
            match non_empty(lookup(key)) {
                Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                }),
                None => Ok(fallback),
            }
        };
        let flag = |key: &str, fallback: bool| -> bool {
            non_empty(lookup(key))
                .map(|value| parse_bool(&value))
                .unwrap_or(fallback)
        };

        Ok(Self {
            codex_bin: non_empty(lookup("ADS_CODEX_BIN")).unwrap_or(defaults.codex_bin),
            amp_bin: non_empty(lookup("ADS_AMP_BIN")),
            claude_bin: non_empty(lookup("ADS_CLAUDE_BIN")),
            gemini_bin: non_empty(lookup("ADS_GEMINI_BIN")),
            droid_bin: non_empty(lookup("ADS_DROID_BIN")),
            probe_timeout_ms: parse_u64("ADS_AGENT_PROBE_TIMEOUT_MS", defaults.probe_timeout_ms)?,
            coordinator_enabled: flag("ADS_COORDINATOR_ENABLED", defaults.coordinator_enabled),
            verification_enabled: flag(
                "ADS_TASK_VERIFICATION_ENABLED",
                defaults.verification_enabled,
            ),
            exec_tool_enabled: flag("ENABLE_AGENT_EXEC_TOOL", defaults.exec_tool_enabled),
            claude_enabled: flag("ENABLE_CLAUDE_AGENT", defaults.claude_enabled),
            gemini_enabled: flag("ENABLE_GEMINI_AGENT", defaults.gemini_enabled),
            claude_api_key: non_empty(lookup("CLAUDE_API_KEY"))
                .or_else(|| non_empty(lookup("ANTHROPIC_API_KEY"))),
            claude_model: non_empty(lookup("CLAUDE_MODEL")).unwrap_or(defaults.claude_model),
            claude_base_url: non_empty(lookup("CLAUDE_BASE_URL"))
                .unwrap_or(defaults.claude_base_url),
            gemini_api_key: non_empty(lookup("GEMINI_API_KEY"))
                .or_else(|| non_empty(lookup("GOOGLE_API_KEY"))),
            gemini_model: non_empty(lookup("GEMINI_MODEL")).unwrap_or(defaults.gemini_model),
            gemini_use_vertex: flag("GOOGLE_GENAI_USE_VERTEXAI", defaults.gemini_use_vertex),
            verification_allowlist: non_empty(lookup("ADS_TASK_VERIFICATION_ALLOWLIST"))
                .map(|value| {
                    value
                        .split(',')
                        .map(|entry| entry.trim().to_string())
                        .filter(|entry| !entry.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            session_timeout_ms: parse_i64("ADS_SESSION_TIMEOUT_MS", defaults.session_timeout_ms)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentFeatureFlags {
    pub claude: bool,
    pub gemini: bool,
    pub amp: bool,
    pub droid: bool,
}

/// Which optional agents are buildable: a flag must be on and the matching
/// credentials or binary must be present.
pub fn agent_feature_flags(config: &AdsConfig) -> AgentFeatureFlags {
    AgentFeatureFlags {
        claude: config.claude_enabled && config.claude_api_key.is_some(),
        gemini: config.gemini_enabled
            && (config.gemini_api_key.is_some() || config.gemini_use_vertex),
        amp: config.amp_bin.is_some(),
        droid: config.droid_bin.is_some(),
    }
}

#[derive(Debug, Clone)]
pub struct ClaudeAgentConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

pub fn resolve_claude_agent_config(config: &AdsConfig) -> Option<ClaudeAgentConfig> {
    if !config.claude_enabled {
        return None;
    }
    let api_key = config.claude_api_key.clone()?;
    Some(ClaudeAgentConfig {
        api_key,
        model: config.claude_model.clone(),
        base_url: config.claude_base_url.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = AdsConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.codex_bin, "codex");
        assert_eq!(config.probe_timeout_ms, 3_000);
        assert!(config.coordinator_enabled);
        assert!(config.claude_api_key.is_none());
    }

    #[test]
    fn anthropic_key_is_a_fallback_for_claude_key() {
        let config =
            AdsConfig::from_lookup(lookup(&[("ANTHROPIC_API_KEY", "sk-fallback")])).unwrap();
        assert_eq!(config.claude_api_key.as_deref(), Some("sk-fallback"));

        let config = AdsConfig::from_lookup(lookup(&[
            ("CLAUDE_API_KEY", "sk-primary"),
            ("ANTHROPIC_API_KEY", "sk-fallback"),
        ]))
        .unwrap();
        assert_eq!(config.claude_api_key.as_deref(), Some("sk-primary"));
    }

    #[test]
    fn feature_flags_require_credentials() {
        let config = AdsConfig::from_lookup(lookup(&[("ENABLE_CLAUDE_AGENT", "true")])).unwrap();
        assert!(!agent_feature_flags(&config).claude);

        let config = AdsConfig::from_lookup(lookup(&[
            ("ENABLE_CLAUDE_AGENT", "true"),
            ("CLAUDE_API_KEY", "sk-1"),
        ]))
        .unwrap();
        assert!(agent_feature_flags(&config).claude);

        let config = AdsConfig::from_lookup(lookup(&[
            ("ENABLE_CLAUDE_AGENT", "false"),
            ("CLAUDE_API_KEY", "sk-1"),
        ]))
        .unwrap();
        assert!(!agent_feature_flags(&config).claude);
    }

    #[test]
    fn vertex_counts_as_gemini_credentials() {
        let config =
            AdsConfig::from_lookup(lookup(&[("GOOGLE_GENAI_USE_VERTEXAI", "1")])).unwrap();
        assert!(agent_feature_flags(&config).gemini);
    }

    #[test]
    fn allowlist_splits_and_trims() {
        let config = AdsConfig::from_lookup(lookup(&[(
            "ADS_TASK_VERIFICATION_ALLOWLIST",
            "cargo, npm ,pytest,,",
        )]))
        .unwrap();
        assert_eq!(config.verification_allowlist, vec!["cargo", "npm", "pytest"]);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = AdsConfig::from_lookup(lookup(&[("ADS_AGENT_PROBE_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn claude_config_resolution_is_pure() {
        let config = AdsConfig::from_lookup(lookup(&[
            ("CLAUDE_API_KEY", "sk-1"),
            ("CLAUDE_MODEL", "claude-opus-4"),
            ("CLAUDE_BASE_URL", "https://proxy.example.com"),
        ]))
        .unwrap();
        let claude = resolve_claude_agent_config(&config).unwrap();
        assert_eq!(claude.model, "claude-opus-4");
        assert_eq!(claude.base_url, "https://proxy.example.com");
    }
}
