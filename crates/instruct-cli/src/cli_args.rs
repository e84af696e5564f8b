//! CLI argument parsing for instruct.

use clap::{Parser, Subcommand};

#[derive(Parser, Clone)]
#[command(name = "instruct")]
#[command(about = "Send a prompt to a hosted or local text-generation backend")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Clone)]
pub enum Command {
    /// Send one prompt and print the response
    Run {
        /// Prompt text
        prompt: String,

        /// Override the configured provider (e.g. 'hosted.default' or 'local.starchat')
        #[arg(long, value_name = "PROVIDER")]
        provider: Option<String>,

        /// Override the model (hosted) or model path (local) of the selected provider
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Number of tokens the prompt already occupies
        #[arg(long, default_value_t = 0)]
        input_tokens: u32,
    },

    /// Check hardware capabilities and configured providers without loading models
    Preflight,

    /// Load a small local model and print one generated response
    Smoke {
        /// Local GGUF model file to load (e.g. a gpt2 conversion)
        #[arg(long, value_name = "PATH")]
        model_path: String,

        /// Prompt to send
        #[arg(long, default_value = "Hello")]
        prompt: String,
    },
}
