use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    instruct_cli::run().await
}
