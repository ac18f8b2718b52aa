#[tokio::main]
async fn main() -> anyhow::Result<()> {
    katana_lib::run().await
}
