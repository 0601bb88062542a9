use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    mao::cli::run().await
}
