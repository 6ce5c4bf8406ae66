#[tokio::main]
async fn main() -> eyre::Result<()> {
    leasemq::run().start().await
}
