//! Configuration for the engine.
//!
//! Everything is resolved from environment variables (a `.env` file is
//! loaded first when present). Each section has its own `resolve()` so the
//! defaults stay next to the keys they belong to.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Main configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub browser: BrowserConfig,
    pub safety: SafetyConfig,
}

impl Config {
    /// Load configuration from the environment. A missing `.env` file is
    /// fine; a missing `DATABASE_URL` is not.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database: DatabaseConfig::resolve()?,
            server: ServerConfig::resolve()?,
            providers: ProvidersConfig::resolve()?,
            browser: BrowserConfig::resolve()?,
            safety: SafetyConfig::resolve()?,
        })
    }
}

/// Persistence connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let url = optional_env("DATABASE_URL").ok_or_else(|| ConfigError::MissingRequired {
            key: "DATABASE_URL".to_string(),
            hint: "e.g. postgres://skiff@localhost/skiff".to_string(),
        })?;
        Ok(Self { url })
    }
}

/// Settings consumed by the transport layer and by screenshot URLs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Base URL under which scratch artifacts (screenshots) are served.
    pub base_url: String,
    /// Comma-separated origin list; only used by the transport's origin check.
    pub cors_allowed_origins: String,
}

impl ServerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let port = parse_env("PORT", 8080u16)?;
        let base_url =
            optional_env("BASE_URL").unwrap_or_else(|| format!("http://localhost:{port}"));
        let cors_allowed_origins = optional_env("CORS_ALLOWED_ORIGINS").unwrap_or_else(|| {
            "http://localhost:3000,http://localhost:5173,http://127.0.0.1:3000,http://127.0.0.1:5173"
                .to_string()
        });
        Ok(Self {
            port,
            base_url,
            cors_allowed_origins,
        })
    }
}

/// OpenAI (hosted) provider settings.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<SecretString>,
    pub model: String,
    pub server_url: String,
}

/// Ollama settings. The OpenAI-compatible endpoint under `/v1` is used.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub model: String,
    pub server_url: String,
}

/// Settings shared by the OpenAI-compatible local servers (LM Studio,
/// LocalAI, and any generic endpoint).
#[derive(Debug, Clone)]
pub struct CompatConfig {
    pub model: String,
    pub server_url: String,
    pub api_key: Option<SecretString>,
}

/// All provider backends. A flow stores a provider tag; the factory picks
/// the matching section at worker startup.
#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub openai: OpenAiConfig,
    pub ollama: OllamaConfig,
    pub lmstudio: CompatConfig,
    pub localai: CompatConfig,
    pub compat: CompatConfig,
}

impl ProvidersConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let openai = OpenAiConfig {
            api_key: optional_env("OPEN_AI_KEY").map(SecretString::from),
            model: optional_env("OPEN_AI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            server_url: optional_env("OPEN_AI_SERVER_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        };

        let ollama = OllamaConfig {
            model: optional_env("OLLAMA_MODEL").unwrap_or_default(),
            server_url: optional_env("OLLAMA_SERVER_URL")
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        };

        let lmstudio = CompatConfig {
            model: optional_env("LMSTUDIO_MODEL").unwrap_or_default(),
            server_url: optional_env("LMSTUDIO_SERVER_URL")
                .unwrap_or_else(|| "http://localhost:1234/v1".to_string()),
            // LM Studio ignores the key but the wire format wants one.
            api_key: Some(SecretString::from("lm-studio".to_string())),
        };

        let localai = CompatConfig {
            model: optional_env("LOCALAI_MODEL").unwrap_or_default(),
            server_url: optional_env("LOCALAI_SERVER_URL")
                .unwrap_or_else(|| "http://localhost:8080/v1".to_string()),
            api_key: Some(SecretString::from("local-ai".to_string())),
        };

        let compat = CompatConfig {
            model: optional_env("OPENAI_COMPATIBLE_MODEL").unwrap_or_default(),
            server_url: optional_env("OPENAI_COMPATIBLE_SERVER_URL").unwrap_or_default(),
            api_key: Some(SecretString::from(
                optional_env("OPENAI_COMPATIBLE_API_KEY")
                    .unwrap_or_else(|| "not-needed".to_string()),
            )),
        };

        Ok(Self {
            openai,
            ollama,
            lmstudio,
            localai,
            compat,
        })
    }
}

/// Browser control settings.
#[derive(Debug, Clone, Default)]
pub struct BrowserConfig {
    /// Explicit CDP debug URL. When unset, the service discovers one from
    /// the candidate hosts.
    pub debug_url: Option<String>,
}

impl BrowserConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            debug_url: optional_env("CHROME_DEBUG_URL"),
        })
    }
}

/// Safety-filter switches.
#[derive(Debug, Clone, Default)]
pub struct SafetyConfig {
    /// Development override: accept sandbox images outside the whitelist.
    pub allow_any_image: bool,
}

impl SafetyConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            allow_any_image: parse_env("ALLOW_ANY_DOCKER_IMAGE", false)?,
        })
    }
}

/// Read an env var, treating empty values as unset.
fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Read and parse an env var, falling back to `default` when unset.
fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default() {
        let port: u16 = parse_env("SKIFF_TEST_UNSET_PORT", 8080).unwrap();
        assert_eq!(port, 8080);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        // SAFETY: test-only env mutation, key is unique to this test.
        unsafe {
            std::env::set_var("SKIFF_TEST_BAD_PORT", "not-a-port");
        }
        let result: Result<u16, _> = parse_env("SKIFF_TEST_BAD_PORT", 8080);
        assert!(result.is_err());
        unsafe {
            std::env::remove_var("SKIFF_TEST_BAD_PORT");
        }
    }

    #[test]
    fn optional_env_treats_empty_as_unset() {
        // SAFETY: test-only env mutation, key is unique to this test.
        unsafe {
            std::env::set_var("SKIFF_TEST_EMPTY", "   ");
        }
        assert!(optional_env("SKIFF_TEST_EMPTY").is_none());
        unsafe {
            std::env::remove_var("SKIFF_TEST_EMPTY");
        }
    }
}
