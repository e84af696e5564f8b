//! instruct CLI - send prompts to hosted or local text-generation backends.

pub mod commands;
pub mod preflight;
pub mod provider_registration;

mod cli_args;

use anyhow::Result;
use clap::Parser;

pub use cli_args::{Cli, Command};

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    initialize_logging(cli.verbose);

    match cli.command {
        Command::Run {
            prompt,
            provider,
            model,
            input_tokens,
        } => {
            commands::run_command(cli.config.as_deref(), &prompt, provider, model, input_tokens)
                .await
        }
        Command::Preflight => commands::preflight_command(cli.config.as_deref()),
        Command::Smoke { model_path, prompt } => {
            commands::smoke_command(model_path, &prompt).await
        }
    }
}

fn initialize_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::from_default_env()
            .add_directive("instruct=debug".parse().unwrap())
            .add_directive("instruct_cli=debug".parse().unwrap())
            .add_directive("instruct_config=debug".parse().unwrap())
            .add_directive("instruct_providers=debug".parse().unwrap())
            .add_directive("llama_cpp_2=debug".parse().unwrap())
    } else {
        EnvFilter::from_default_env()
            .add_directive("instruct=info".parse().unwrap())
            .add_directive("instruct_cli=info".parse().unwrap())
            .add_directive("instruct_config=info".parse().unwrap())
            .add_directive("instruct_providers=info".parse().unwrap())
            .add_directive("llama_cpp_2=off".parse().unwrap())
            .add_directive("llama=off".parse().unwrap())
    };

    // llama.cpp logs bypass tracing unless routed through it
    instruct_providers::set_backend_logging(verbose);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
