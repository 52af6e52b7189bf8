use anyhow::Result;
use clap::Parser;
use smoker_monitor::cli::ProducerArgs;
use smoker_monitor::config::Config;
use smoker_monitor::{logging, producer, shutdown};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ProducerArgs::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config);
    config.validate()?;
    logging::init_tracing(&config, "smoker-producer")?;

    let token = CancellationToken::new();
    let signals = shutdown::spawn_signal_handler(token.clone());

    let result = producer::serve(&config, args.override_message(), token.clone()).await;
    token.cancel();
    signals.await.ok();

    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "producer exited");
    }
    logging::shutdown_tracing();
    result.map(|_| ())
}
