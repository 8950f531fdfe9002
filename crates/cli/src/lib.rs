pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use chatterbox_core::config::{ConfigOverrides, LoadOptions, RuntimeMode};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "chatterbox",
    about = "Chatterbox operator CLI",
    long_about = "Run a real-time bot session and inspect its effective configuration.",
    after_help = "Examples:\n  chatterbox run\n  chatterbox run --mode development --dev-channel '#bot-dev'\n  chatterbox config"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a chatterbox.toml file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Connect a session, answer `ping` with `pong`, and run until ctrl-c")]
    Run {
        #[arg(long, help = "Runtime mode override (development|production)")]
        mode: Option<RuntimeMode>,
        #[arg(long, help = "Dev channel override, e.g. '#bot-dev'")]
        dev_channel: Option<String>,
    },
    #[command(about = "Print the effective configuration as JSON with secrets redacted")]
    Config,
}

impl Cli {
    fn load_options(&self, overrides: ConfigOverrides) -> LoadOptions {
        LoadOptions {
            require_file: self.config.is_some(),
            config_path: self.config.clone(),
            overrides,
        }
    }
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Run { mode, dev_channel } => {
            let overrides = ConfigOverrides {
                runtime_mode: *mode,
                dev_channel: dev_channel.clone(),
                ..ConfigOverrides::default()
            };
            commands::run::run(cli.load_options(overrides)).await
        }
        Command::Config => commands::config::run(cli.load_options(ConfigOverrides::default())),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
