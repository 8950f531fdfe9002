use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_API_BASE_URL: &str = "https://slack.com/api";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub slack: SlackConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    pub api_base_url: String,
    pub im_prefix: Option<String>,
    pub dev_channel: Option<String>,
    pub webhook: Option<WebhookConfig>,
}

/// Incoming-webhook endpoint plus the defaults merged into every posted message.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub url: SecretString,
    pub channel: Option<String>,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
    pub icon_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Development mode restricts a session to the configured dev channel;
/// production mode ignores that channel entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Development,
    #[default]
    Production,
}

impl RuntimeMode {
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub bot_token: Option<String>,
    pub api_base_url: Option<String>,
    pub dev_channel: Option<String>,
    pub runtime_mode: Option<RuntimeMode>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            slack: SlackConfig {
                bot_token: String::new().into(),
                api_base_url: DEFAULT_API_BASE_URL.to_string(),
                im_prefix: None,
                dev_channel: None,
                webhook: None,
            },
            runtime: RuntimeConfig { mode: RuntimeMode::Production },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for RuntimeMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Validation(format!(
                "unsupported runtime mode `{other}` (expected development|production)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("chatterbox.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(slack) = patch.slack {
            if let Some(bot_token_value) = slack.bot_token {
                self.slack.bot_token = secret_value(bot_token_value);
            }
            if let Some(api_base_url) = slack.api_base_url {
                self.slack.api_base_url = api_base_url;
            }
            if let Some(im_prefix) = slack.im_prefix {
                self.slack.im_prefix = Some(im_prefix);
            }
            if let Some(dev_channel) = slack.dev_channel {
                self.slack.dev_channel = Some(dev_channel);
            }
            if let Some(webhook) = slack.webhook {
                self.slack.webhook = Some(WebhookConfig {
                    url: secret_value(webhook.url),
                    channel: webhook.channel,
                    username: webhook.username,
                    icon_emoji: webhook.icon_emoji,
                    icon_url: webhook.icon_url,
                });
            }
        }

        if let Some(runtime) = patch.runtime {
            if let Some(mode) = runtime.mode {
                self.runtime.mode = mode;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CHATTERBOX_SLACK_BOT_TOKEN") {
            self.slack.bot_token = secret_value(value);
        }
        if let Some(value) = read_env("CHATTERBOX_SLACK_API_BASE_URL") {
            self.slack.api_base_url = value;
        }
        if let Some(value) = read_env("CHATTERBOX_SLACK_IM_PREFIX") {
            self.slack.im_prefix = Some(value);
        }
        if let Some(value) = read_env("CHATTERBOX_SLACK_DEV_CHANNEL") {
            self.slack.dev_channel = Some(value);
        }
        if let Some(value) = read_env("CHATTERBOX_SLACK_WEBHOOK_URL") {
            match self.slack.webhook.as_mut() {
                Some(webhook) => webhook.url = secret_value(value),
                None => {
                    self.slack.webhook = Some(WebhookConfig {
                        url: secret_value(value),
                        channel: None,
                        username: None,
                        icon_emoji: None,
                        icon_url: None,
                    });
                }
            }
        }

        let mode = read_env("CHATTERBOX_RUNTIME_MODE").or_else(|| read_env("CHATTERBOX_ENV"));
        if let Some(value) = mode {
            self.runtime.mode = value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                key: "CHATTERBOX_RUNTIME_MODE".to_string(),
                value,
            })?;
        }

        let log_level =
            read_env("CHATTERBOX_LOGGING_LEVEL").or_else(|| read_env("CHATTERBOX_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CHATTERBOX_LOGGING_FORMAT").or_else(|| read_env("CHATTERBOX_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bot_token) = overrides.bot_token {
            self.slack.bot_token = secret_value(bot_token);
        }
        if let Some(api_base_url) = overrides.api_base_url {
            self.slack.api_base_url = api_base_url;
        }
        if let Some(dev_channel) = overrides.dev_channel {
            self.slack.dev_channel = Some(dev_channel);
        }
        if let Some(mode) = overrides.runtime_mode {
            self.runtime.mode = mode;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_slack(&self.slack)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("chatterbox.toml"), PathBuf::from("config/chatterbox.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_slack(slack: &SlackConfig) -> Result<(), ConfigError> {
    let bot_token = slack.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.bot_token is required. Get it from https://api.slack.com/apps > Your App > OAuth & Permissions > Bot User OAuth Token".to_string()
        ));
    }
    if !bot_token.starts_with("xoxb-") && !bot_token.starts_with("xoxp-") {
        let hint = if bot_token.starts_with("xapp-") {
            " (hint: you may have used an app-level token instead of the bot token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.bot_token must start with `xoxb-` or `xoxp-`{hint}"
        )));
    }

    if !is_http_url(&slack.api_base_url) {
        return Err(ConfigError::Validation(
            "slack.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if let Some(dev_channel) = &slack.dev_channel {
        let dev_channel = dev_channel.trim();
        let well_formed = dev_channel.len() > 1
            && (dev_channel.starts_with('#')
                || dev_channel.starts_with('@')
                || dev_channel.chars().all(|ch| ch.is_ascii_alphanumeric()));
        if !well_formed {
            return Err(ConfigError::Validation(format!(
                "slack.dev_channel `{dev_channel}` must be `#channel`, `@user`, or a raw channel id"
            )));
        }
    }

    if let Some(webhook) = &slack.webhook {
        if !is_http_url(webhook.url.expose_secret()) {
            return Err(ConfigError::Validation(
                "slack.webhook.url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    slack: Option<SlackPatch>,
    runtime: Option<RuntimePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    bot_token: Option<String>,
    api_base_url: Option<String>,
    im_prefix: Option<String>,
    dev_channel: Option<String>,
    webhook: Option<WebhookPatch>,
}

#[derive(Debug, Deserialize)]
struct WebhookPatch {
    url: String,
    channel: Option<String>,
    username: Option<String>,
    icon_emoji: Option<String>,
    icon_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimePatch {
    mode: Option<RuntimeMode>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, RuntimeMode};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CHATTERBOX_BOT_TOKEN", "xoxb-from-env");
        env::set_var("TEST_CHATTERBOX_WEBHOOK", "https://hooks.example.test/T1/B1");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("chatterbox.toml");
            fs::write(
                &path,
                r##"
[slack]
bot_token = "${TEST_CHATTERBOX_BOT_TOKEN}"
dev_channel = "#bot-dev"

[slack.webhook]
url = "${TEST_CHATTERBOX_WEBHOOK}"
username = "chatterbox"
"##,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.slack.bot_token.expose_secret() == "xoxb-from-env",
                "bot token should be loaded from environment",
            )?;
            ensure(
                config.slack.dev_channel.as_deref() == Some("#bot-dev"),
                "dev channel should come from the file",
            )?;
            let webhook = config.slack.webhook.ok_or("webhook should be configured")?;
            ensure(
                webhook.url.expose_secret() == "https://hooks.example.test/T1/B1",
                "webhook url should be interpolated",
            )?;
            ensure(webhook.username.as_deref() == Some("chatterbox"), "username should load")?;
            Ok(())
        })();

        clear_vars(&["TEST_CHATTERBOX_BOT_TOKEN", "TEST_CHATTERBOX_WEBHOOK"]);
        result
    }

    #[test]
    fn runtime_mode_and_logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHATTERBOX_SLACK_BOT_TOKEN", "xoxb-test");
        env::set_var("CHATTERBOX_ENV", "development");
        env::set_var("CHATTERBOX_LOG_LEVEL", "warn");
        env::set_var("CHATTERBOX_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.runtime.mode == RuntimeMode::Development,
                "development mode should be set from env var",
            )?;
            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "CHATTERBOX_SLACK_BOT_TOKEN",
            "CHATTERBOX_ENV",
            "CHATTERBOX_LOG_LEVEL",
            "CHATTERBOX_LOG_FORMAT",
        ]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHATTERBOX_SLACK_BOT_TOKEN", "xoxb-from-env");
        env::set_var("CHATTERBOX_SLACK_DEV_CHANNEL", "#from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("chatterbox.toml");
            fs::write(
                &path,
                r##"
[slack]
bot_token = "xoxb-from-file"
dev_channel = "#from-file"

[runtime]
mode = "development"

[logging]
level = "warn"
"##,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    dev_channel: Some("#from-override".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.slack.dev_channel.as_deref() == Some("#from-override"),
                "override dev channel should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.slack.bot_token.expose_secret() == "xoxb-from-env",
                "env bot token should win over file and defaults",
            )?;
            ensure(
                config.runtime.mode == RuntimeMode::Development,
                "file runtime mode should win over defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["CHATTERBOX_SLACK_BOT_TOKEN", "CHATTERBOX_SLACK_DEV_CHANNEL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHATTERBOX_SLACK_BOT_TOKEN", "xapp-wrong-kind");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };

            ensure(
                matches!(error, ConfigError::Validation(_)),
                "invalid token should fail validation",
            )?;
            let message = error.to_string();
            ensure(message.contains("slack.bot_token"), "error should name the field")?;
            ensure(message.contains("app-level token"), "error should carry the token hint")?;
            Ok(())
        })();

        clear_vars(&["CHATTERBOX_SLACK_BOT_TOKEN"]);
        result
    }

    #[test]
    fn invalid_runtime_mode_env_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHATTERBOX_SLACK_BOT_TOKEN", "xoxb-test");
        env::set_var("CHATTERBOX_RUNTIME_MODE", "staging");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, value }) => {
                ensure(key == "CHATTERBOX_RUNTIME_MODE", "error should name the variable")?;
                ensure(value == "staging", "error should carry the rejected value")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected invalid runtime mode to be rejected".to_string()),
        };

        clear_vars(&["CHATTERBOX_SLACK_BOT_TOKEN", "CHATTERBOX_RUNTIME_MODE"]);
        result
    }

    #[test]
    fn malformed_dev_channel_is_rejected() {
        let mut config = AppConfig::default();
        config.slack.bot_token = "xoxb-test".to_string().into();
        config.slack.dev_channel = Some("bot dev".to_string());

        let error = config.validate().expect_err("dev channel with a space should be rejected");
        assert!(error.to_string().contains("slack.dev_channel"));
    }

    #[test]
    fn missing_required_file_is_reported() {
        let error = AppConfig::load(LoadOptions {
            config_path: Some("/nonexistent/chatterbox.toml".into()),
            require_file: true,
            ..LoadOptions::default()
        })
        .expect_err("missing file should be an error when required");

        assert!(matches!(error, ConfigError::MissingConfigFile(_)));
    }
}
