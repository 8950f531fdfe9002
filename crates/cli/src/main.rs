use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    chatterbox_cli::run().await
}
