#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ruleforge::telemetry::init_tracing();
    ruleforge::run().await
}
