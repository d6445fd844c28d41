//! Environment-driven configuration.
//!
//! All runtime knobs come from environment variables so the proxy can run
//! unchanged in containers and on bare metal. `Config::from_env` never
//! fails: malformed values fall back to defaults with a warning.

use std::collections::HashMap;

/// Default listen port.
const DEFAULT_PORT: u16 = 8080;

/// Default bind address.
const DEFAULT_HOST: &str = "0.0.0.0";

/// Default OAuth callback port (onboarding CLI, not served here).
const DEFAULT_OAUTH_CALLBACK_PORT: u16 = 9876;

/// Account-selection strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Stay on the current account until it becomes unusable.
    Sticky,
    /// Rotate on every request.
    RoundRobin,
    /// Scored selection over health, token bucket, and quota trackers.
    #[default]
    Hybrid,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sticky" => Ok(Self::Sticky),
            "round-robin" | "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Runtime configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (`HOST`).
    pub host: String,
    /// Listen port (`PORT`).
    pub port: u16,
    /// Client-facing API key gate (`API_KEY`); `None` disables the gate.
    pub api_key: Option<String>,
    /// Password for the management UI (`WEBUI_PASSWORD`); the UI itself is
    /// served by a separate process, the value is only validated here.
    pub webui_password: Option<String>,
    /// Verbose logging (`DEBUG`).
    pub debug: bool,
    /// Development mode: allows seeding accounts from a local file (`DEV_MODE`).
    pub dev_mode: bool,
    /// Fallback model id consulted when the primary is exhausted (`FALLBACK`).
    pub fallback_model: Option<String>,
    /// Port the onboarding CLI listens on for OAuth callbacks
    /// (`OAUTH_CALLBACK_PORT`).
    pub oauth_callback_port: u16,
    /// Redis address, e.g. `redis://127.0.0.1:6379` (`REDIS_ADDR`).
    pub redis_addr: Option<String>,
    /// Redis password (`REDIS_PASSWORD`).
    pub redis_password: Option<String>,
    /// Client-facing model aliases, `from=to,from2=to2` (`MODEL_ALIASES`).
    pub model_aliases: HashMap<String, String>,
    /// Selection strategy (`STRATEGY`), default hybrid.
    pub strategy: StrategyKind,
    /// Upstream endpoint override, comma-separated (tests and self-hosted
    /// gateways); defaults to the Cloud Code endpoints.
    pub upstream_endpoints: Option<Vec<String>>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let port = env_parse("PORT", DEFAULT_PORT);
        let host = std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());

        let fallback_model = std::env::var("FALLBACK").ok().and_then(|v| {
            let v = v.trim().to_string();
            if v.is_empty() || v.eq_ignore_ascii_case("false") || v == "0" {
                None
            } else {
                Some(v)
            }
        });

        let strategy = match std::env::var("STRATEGY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "Invalid STRATEGY, using hybrid");
                StrategyKind::Hybrid
            }),
            Err(_) => StrategyKind::Hybrid,
        };

        Self {
            host,
            port,
            api_key: env_nonempty("API_KEY"),
            webui_password: env_nonempty("WEBUI_PASSWORD"),
            debug: env_flag("DEBUG"),
            dev_mode: env_flag("DEV_MODE"),
            fallback_model,
            oauth_callback_port: env_parse("OAUTH_CALLBACK_PORT", DEFAULT_OAUTH_CALLBACK_PORT),
            redis_addr: env_nonempty("REDIS_ADDR"),
            redis_password: env_nonempty("REDIS_PASSWORD"),
            model_aliases: parse_aliases(&std::env::var("MODEL_ALIASES").unwrap_or_default()),
            strategy,
            upstream_endpoints: env_nonempty("UPSTREAM_ENDPOINTS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
        }
    }

    /// Address string suitable for `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve a client-supplied model id through the alias map.
    pub fn resolve_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_aliases
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            api_key: None,
            webui_password: None,
            debug: false,
            dev_mode: false,
            fallback_model: None,
            oauth_callback_port: DEFAULT_OAUTH_CALLBACK_PORT,
            redis_addr: None,
            redis_password: None,
            model_aliases: HashMap::new(),
            strategy: StrategyKind::Hybrid,
            upstream_endpoints: None,
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = key, value = %raw, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Parse `from=to,from2=to2` into an alias map. Malformed pairs are skipped.
fn parse_aliases(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (from, to) = pair.split_once('=')?;
            let (from, to) = (from.trim(), to.trim());
            if from.is_empty() || to.is_empty() {
                None
            } else {
                Some((from.to_string(), to.to_string()))
            }
        })
        .collect()
}
