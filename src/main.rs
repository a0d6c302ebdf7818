#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli_relay::run().await
}
