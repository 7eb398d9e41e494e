// intercom-signaling-service/src/main.rs
use anyhow::Result;
use intercom_signaling::app::App;

#[tokio::main]
async fn main() -> Result<()> {
    App::bootstrap().await?.run().await?;
    Ok(())
}
