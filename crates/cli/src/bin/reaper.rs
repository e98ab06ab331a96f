use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    reaper_cli::main_entry().await
}
