use crate::error::GuardError;
use crate::rate_limit::DEFAULT_MAX_ATTEMPTS;
use crate::whitelist::Whitelist;
use clap::Parser;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_BLOCK_THRESHOLD: u32 = 3;
pub const DEFAULT_CLEANUP_DAYS: u32 = 30;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_UPSTREAM_URL: &str = "http://localhost:8080";
pub const DEFAULT_SESSION_COOKIE_PREFIX: &str = "wp_woocommerce_session_";
pub const DEFAULT_GEO_ENDPOINT: &str = "http://ip-api.com";

const ENV_PREFIX: &str = "CHECKOUT_GUARD_";

/// Immutable snapshot of the detection settings, handed to the decision
/// engine for each evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSettings {
    /// Global switch. When off the engine is skipped entirely.
    pub enabled: bool,
    /// Log-only mode: suspicious requests are recorded but never blocked.
    pub test_mode: bool,
    pub block_threshold: u32,
    /// Flagged attempts per IP per hour before `rate_limit_exceeded` fires
    pub rate_limit: u32,
    pub whitelist: Whitelist,
    pub auto_cleanup: bool,
    /// Audit retention in days
    pub cleanup_days: u32,
    /// Canonical origin a valid referer must start with
    pub site_origin: String,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            test_mode: true,
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
            rate_limit: DEFAULT_MAX_ATTEMPTS,
            whitelist: Whitelist::new(),
            auto_cleanup: true,
            cleanup_days: DEFAULT_CLEANUP_DAYS,
            site_origin: DEFAULT_UPSTREAM_URL.to_string(),
        }
    }
}

/// Shared holder for the live settings. Readers clone a snapshot per request.
pub type SharedSettings = std::sync::Arc<tokio::sync::RwLock<GuardSettings>>;

/// Configuration loaded from CLI args, environment variables, and/or config files
///
/// Config precedence: CLI args > env vars > config file > defaults
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub upstream_url: String,
    pub audit_db_path: Option<PathBuf>,
    pub admin_token: Option<String>,
    /// `None` means the storefront session cannot be observed
    pub session_cookie_prefix: Option<String>,
    pub geo_enabled: bool,
    pub geo_endpoint: String,
    pub log_level: String,
    pub settings: GuardSettings,
}

/// CLI arguments structure for clap
#[derive(Debug, Default, Parser)]
#[command(name = "checkout-guard")]
#[command(about = "Checkout guard - card-testing bot filter for storefront checkout endpoints")]
pub struct CliArgs {
    /// Path to configuration file (TOML or YAML)
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Address to listen on (overrides env/config)
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Upstream storefront base URL (overrides env/config)
    #[arg(long)]
    pub upstream_url: Option<String>,

    /// Canonical site origin for referer checks; defaults to the upstream URL
    #[arg(long)]
    pub site_origin: Option<String>,

    /// SQLite file for the audit log; in-memory when unset
    #[arg(long)]
    pub audit_db_path: Option<PathBuf>,

    /// Bearer token for the admin API; the API is disabled when unset
    #[arg(long)]
    pub admin_token: Option<String>,

    /// Cookie name prefix of the storefront session (empty to disable the session check)
    #[arg(long)]
    pub session_cookie_prefix: Option<String>,

    /// Enable or disable the guard (overrides env/config)
    #[arg(long)]
    pub enabled: Option<bool>,

    /// Log-only mode (overrides env/config)
    #[arg(long)]
    pub test_mode: Option<bool>,

    /// Score at or above which requests are blocked (overrides env/config)
    #[arg(long)]
    pub block_threshold: Option<u32>,

    /// Flagged attempts per IP per hour (overrides env/config)
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Comma-separated IPs that bypass the guard (overrides env/config)
    #[arg(long)]
    pub whitelist: Option<String>,

    /// Periodically purge old audit records (overrides env/config)
    #[arg(long)]
    pub auto_cleanup: Option<bool>,

    /// Audit retention in days (overrides env/config)
    #[arg(long)]
    pub cleanup_days: Option<u32>,

    /// Look up client countries for audit records (overrides env/config)
    #[arg(long)]
    pub geo_enabled: Option<bool>,

    /// Geolocation API base URL (overrides env/config)
    #[arg(long)]
    pub geo_endpoint: Option<String>,

    /// Logging level: trace, debug, info, warn, error (overrides env/config)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Config file structure (deserialized from TOML/YAML)
#[derive(Debug, Default, Deserialize, Clone)]
struct ConfigFile {
    sidecar: Option<SidecarSection>,
    guard: Option<GuardSection>,
    geolocation: Option<GeolocationSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct SidecarSection {
    listen_addr: Option<String>,
    upstream_url: Option<String>,
    site_origin: Option<String>,
    audit_db_path: Option<PathBuf>,
    admin_token: Option<String>,
    session_cookie_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct GuardSection {
    enabled: Option<bool>,
    test_mode: Option<bool>,
    block_threshold: Option<u32>,
    rate_limit: Option<u32>,
    whitelist: Option<String>,
    auto_cleanup: Option<bool>,
    cleanup_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct GeolocationSection {
    enabled: Option<bool>,
    endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct LoggingSection {
    level: Option<String>,
}

/// Intermediate structure for env var config (all optional for precedence)
#[derive(Debug, Default)]
struct EnvConfig {
    listen_addr: Option<String>,
    upstream_url: Option<String>,
    site_origin: Option<String>,
    audit_db_path: Option<PathBuf>,
    admin_token: Option<String>,
    session_cookie_prefix: Option<String>,
    enabled: Option<bool>,
    test_mode: Option<bool>,
    block_threshold: Option<u32>,
    rate_limit: Option<u32>,
    whitelist: Option<String>,
    auto_cleanup: Option<bool>,
    cleanup_days: Option<u32>,
    geo_enabled: Option<bool>,
    geo_endpoint: Option<String>,
    log_level: Option<String>,
}

/// First value present in precedence order.
fn pick<T>(cli: Option<T>, env: Option<T>, file: Option<T>) -> Option<T> {
    cli.or(env).or(file)
}

impl Config {
    /// Load configuration with precedence: CLI args > env vars > config file > defaults
    ///
    /// Nothing is mandatory: missing values fall back to documented defaults.
    pub fn load(cli_args: &CliArgs) -> Result<Config, GuardError> {
        // .env never overrides variables already set in the environment.
        dotenv::dotenv().ok();

        let file = match &cli_args.config_file {
            Some(path) => Self::load_from_file(path)?,
            None => ConfigFile::default(),
        };
        let sidecar = file.sidecar.unwrap_or_default();
        let guard = file.guard.unwrap_or_default();
        let geolocation = file.geolocation.unwrap_or_default();
        let logging = file.logging.unwrap_or_default();

        let env_config = Self::load_from_env();

        let listen_addr = pick(
            cli_args.listen_addr.clone(),
            env_config.listen_addr,
            sidecar.listen_addr,
        )
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

        let upstream_url = pick(
            cli_args.upstream_url.clone(),
            env_config.upstream_url,
            sidecar.upstream_url,
        )
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
        let upstream_url = upstream_url.trim_end_matches('/').to_string();
        if !upstream_url.starts_with("http://") && !upstream_url.starts_with("https://") {
            return Err(GuardError::ConfigError(format!(
                "upstream_url must be an http(s) URL, got {}",
                upstream_url
            )));
        }

        let site_origin = pick(
            cli_args.site_origin.clone(),
            env_config.site_origin,
            sidecar.site_origin,
        )
        .map(|origin| origin.trim_end_matches('/').to_string())
        .unwrap_or_else(|| upstream_url.clone());

        let audit_db_path = pick(
            cli_args.audit_db_path.clone(),
            env_config.audit_db_path,
            sidecar.audit_db_path,
        );

        let admin_token = pick(
            cli_args.admin_token.clone(),
            env_config.admin_token,
            sidecar.admin_token,
        )
        .filter(|t| !t.is_empty());

        // An explicitly empty prefix turns the session check off.
        let session_cookie_prefix = pick(
            cli_args.session_cookie_prefix.clone(),
            env_config.session_cookie_prefix,
            sidecar.session_cookie_prefix,
        )
        .unwrap_or_else(|| DEFAULT_SESSION_COOKIE_PREFIX.to_string());
        let session_cookie_prefix = Some(session_cookie_prefix).filter(|p| !p.is_empty());

        let geo_enabled = pick(cli_args.geo_enabled, env_config.geo_enabled, geolocation.enabled)
            .unwrap_or(true);
        let geo_endpoint = pick(
            cli_args.geo_endpoint.clone(),
            env_config.geo_endpoint,
            geolocation.endpoint,
        )
        .unwrap_or_else(|| DEFAULT_GEO_ENDPOINT.to_string());

        let log_level = pick(cli_args.log_level.clone(), env_config.log_level, logging.level)
            .unwrap_or_else(|| "info".to_string());

        let defaults = GuardSettings::default();
        let settings = GuardSettings {
            enabled: pick(cli_args.enabled, env_config.enabled, guard.enabled).unwrap_or(defaults.enabled),
            test_mode: pick(cli_args.test_mode, env_config.test_mode, guard.test_mode)
                .unwrap_or(defaults.test_mode),
            block_threshold: pick(
                cli_args.block_threshold,
                env_config.block_threshold,
                guard.block_threshold,
            )
            .unwrap_or(defaults.block_threshold),
            rate_limit: pick(cli_args.rate_limit, env_config.rate_limit, guard.rate_limit)
                .unwrap_or(defaults.rate_limit),
            whitelist: pick(cli_args.whitelist.clone(), env_config.whitelist, guard.whitelist)
                .map(|raw| Whitelist::parse(&raw))
                .unwrap_or_default(),
            auto_cleanup: pick(cli_args.auto_cleanup, env_config.auto_cleanup, guard.auto_cleanup)
                .unwrap_or(defaults.auto_cleanup),
            cleanup_days: pick(cli_args.cleanup_days, env_config.cleanup_days, guard.cleanup_days)
                .unwrap_or(defaults.cleanup_days),
            site_origin,
        };

        Ok(Config {
            listen_addr,
            upstream_url,
            audit_db_path,
            admin_token,
            session_cookie_prefix,
            geo_enabled,
            geo_endpoint,
            log_level,
            settings,
        })
    }

    /// Load configuration from file (TOML or YAML)
    fn load_from_file(path: &PathBuf) -> Result<ConfigFile, GuardError> {
        use config::Config as ConfigBuilder;

        if !path.exists() {
            return Err(GuardError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let file_source = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => {
                config::File::from(path.as_path()).format(config::FileFormat::Yaml)
            }
            _ => config::File::from(path.as_path()).format(config::FileFormat::Toml),
        };

        let builder = ConfigBuilder::builder()
            .add_source(file_source)
            .build()
            .map_err(|e| GuardError::ConfigError(format!("Failed to load config file: {}", e)))?;

        builder
            .try_deserialize()
            .map_err(|e| GuardError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    /// Read `CHECKOUT_GUARD_*` variables. Unparseable values count as unset.
    fn load_from_env() -> EnvConfig {
        fn var(name: &str) -> Option<String> {
            env::var(format!("{}{}", ENV_PREFIX, name)).ok()
        }
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            var(name).and_then(|v| v.trim().parse::<T>().ok())
        }

        EnvConfig {
            listen_addr: var("LISTEN_ADDR"),
            upstream_url: var("UPSTREAM_URL"),
            site_origin: var("SITE_ORIGIN"),
            audit_db_path: var("AUDIT_DB_PATH").map(PathBuf::from),
            admin_token: var("ADMIN_TOKEN"),
            session_cookie_prefix: var("SESSION_COOKIE_PREFIX"),
            enabled: parsed("ENABLED"),
            test_mode: parsed("TEST_MODE"),
            block_threshold: parsed("BLOCK_THRESHOLD"),
            rate_limit: parsed("RATE_LIMIT"),
            whitelist: var("WHITELIST"),
            auto_cleanup: parsed("AUTO_CLEANUP"),
            cleanup_days: parsed("CLEANUP_DAYS"),
            geo_enabled: parsed("GEO_ENABLED"),
            geo_endpoint: var("GEO_ENDPOINT"),
            log_level: var("LOG_LEVEL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Tests below mutate process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for name in [
            "LISTEN_ADDR",
            "UPSTREAM_URL",
            "SITE_ORIGIN",
            "AUDIT_DB_PATH",
            "ADMIN_TOKEN",
            "SESSION_COOKIE_PREFIX",
            "ENABLED",
            "TEST_MODE",
            "BLOCK_THRESHOLD",
            "RATE_LIMIT",
            "WHITELIST",
            "AUTO_CLEANUP",
            "CLEANUP_DAYS",
            "GEO_ENABLED",
            "GEO_ENDPOINT",
            "LOG_LEVEL",
        ] {
            std::env::remove_var(format!("{}{}", ENV_PREFIX, name));
        }
    }

    #[test]
    fn test_config_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let config = Config::load(&CliArgs::default()).unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.settings.site_origin, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.session_cookie_prefix.as_deref(), Some(DEFAULT_SESSION_COOKIE_PREFIX));
        assert!(config.admin_token.is_none());
        assert!(config.audit_db_path.is_none());

        let settings = &config.settings;
        assert!(settings.enabled);
        assert!(settings.test_mode);
        assert_eq!(settings.block_threshold, 3);
        assert_eq!(settings.rate_limit, 10);
        assert_eq!(settings.cleanup_days, 30);
        assert!(settings.auto_cleanup);
        assert!(settings.whitelist.is_empty());
    }

    #[test]
    fn test_config_load_from_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("guard.toml");
        let toml_content = r#"
[sidecar]
upstream_url = "https://shop.internal:8443/"
site_origin = "https://shop.example"
session_cookie_prefix = ""

[guard]
test_mode = false
block_threshold = 4
whitelist = "1.2.3.4, 5.6.7.8"

[logging]
level = "warn"
"#;
        fs::write(&config_path, toml_content).unwrap();

        let cli_args = CliArgs {
            config_file: Some(config_path),
            ..CliArgs::default()
        };
        let config = Config::load(&cli_args).unwrap();
        assert_eq!(config.upstream_url, "https://shop.internal:8443");
        assert_eq!(config.settings.site_origin, "https://shop.example");
        assert!(config.session_cookie_prefix.is_none());
        assert!(!config.settings.test_mode);
        assert_eq!(config.settings.block_threshold, 4);
        assert!(config.settings.whitelist.is_whitelisted("5.6.7.8"));
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_config_precedence_cli_env_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("guard.toml");
        fs::write(
            &config_path,
            "[guard]\nblock_threshold = 7\ntest_mode = true\nrate_limit = 20\n",
        )
        .unwrap();

        std::env::set_var("CHECKOUT_GUARD_BLOCK_THRESHOLD", "5");
        std::env::set_var("CHECKOUT_GUARD_TEST_MODE", "false");

        let cli_args = CliArgs {
            config_file: Some(config_path),
            block_threshold: Some(2),
            ..CliArgs::default()
        };
        let config = Config::load(&cli_args).unwrap();

        // CLI beats env, env beats file, file beats defaults
        assert_eq!(config.settings.block_threshold, 2);
        assert!(!config.settings.test_mode);
        assert_eq!(config.settings.rate_limit, 20);

        clear_env();
    }

    #[test]
    fn test_config_rejects_non_http_upstream() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let cli_args = CliArgs {
            upstream_url: Some("ftp://shop".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(Config::load(&cli_args), Err(GuardError::ConfigError(_))));
    }

    #[test]
    fn test_config_missing_file() {
        let cli_args = CliArgs {
            config_file: Some(PathBuf::from("/nonexistent/guard.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(Config::load(&cli_args), Err(GuardError::ConfigError(_))));
    }
}
