use anyhow::{Result, anyhow};
use std::env;
use std::path::PathBuf;

/// Runtime configuration, read once at startup from the environment after
/// the layered `.env` files are applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub base_url: String,
    pub cache_dir: PathBuf,
    pub enable_loader_cache: bool,
    pub enable_result_cache: bool,
    pub enable_unsafe: bool,
    pub secret: String,
    pub concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let app_env = env::var("APP_ENV")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "development".to_string());
        load_dotenv_layers(&app_env);

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let host = env::var("HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = parse_u16("PORT", 8080);
        let metrics_port = parse_u16("METRICS_PORT", 8081);
        let base_url = normalize_base_url(&env::var("BASE_URL").unwrap_or_default());
        let cache_dir =
            PathBuf::from(env::var("CACHE_DIR").unwrap_or_else(|_| "/tmp/cache".to_string()));
        let enable_loader_cache = parse_bool("ENABLE_LOADER_CACHE", true);
        let enable_result_cache = parse_bool("ENABLE_RESULT_CACHE", true);
        let enable_unsafe = parse_bool("ENABLE_UNSAFE", false);
        let secret = env::var("SECRET").unwrap_or_default();
        let concurrency = parse_usize("CONCURRENCY", 8);

        if !enable_unsafe && secret.is_empty() {
            return Err(anyhow!("SECRET must be set when ENABLE_UNSAFE=false"));
        }

        Ok(Self {
            env: app_env,
            log_level,
            host,
            port,
            metrics_port,
            base_url,
            cache_dir,
            enable_loader_cache,
            enable_result_cache,
            enable_unsafe,
            secret,
            concurrency,
        })
    }

    /// Tracing filter directive for the configured log level. `fatal` and
    /// `panic` collapse onto `error`, the most severe level the subscriber
    /// knows.
    pub fn log_filter(&self) -> &str {
        match self.log_level.as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" | "fatal" | "panic" => "error",
            _ => "info",
        }
    }
}

/// Origin base URLs are stored with exactly one trailing slash so the
/// loader can append the media path verbatim. Empty stays empty.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

fn load_dotenv_layers(app_env: &str) {
    // Most specific first; dotenv never overrides variables that are
    // already set, so earlier files win.
    let _ = dotenvy::from_filename(format!(".env.{app_env}.local"));
    if app_env != "test" {
        let _ = dotenvy::from_filename(".env.local");
    }
    let _ = dotenvy::from_filename(format!(".env.{app_env}"));
    let _ = dotenvy::dotenv();
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
