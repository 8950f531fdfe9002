pub mod config;
pub mod run;

use chatterbox_core::config::ConfigError;
use serde::Serialize;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_SESSION: u8 = 3;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome<'a> {
    command: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_class: Option<&'a str>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let outcome =
            CommandOutcome { command, status: "ok", error_class: None, message: message.into() };
        Self { exit_code: 0, output: render(&outcome) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let outcome = CommandOutcome {
            command,
            status: "error",
            error_class: Some(error_class),
            message: message.into(),
        };
        Self { exit_code, output: render(&outcome) }
    }

    pub fn config_failure(command: &str, error: &ConfigError) -> Self {
        Self::failure(command, "config_validation", error.to_string(), EXIT_CONFIG)
    }
}

fn render(outcome: &CommandOutcome<'_>) -> String {
    serde_json::to_string(outcome).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"{}\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            outcome.command,
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
