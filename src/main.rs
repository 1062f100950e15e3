use instant_replay::config::ReplayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    instant_replay::init_tracing();
    let config = ReplayConfig::from_env()?;
    instant_replay::run(config).await
}
