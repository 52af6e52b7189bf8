use anyhow::Result;
use clap::Parser;
use smoker_monitor::cli::ListenerArgs;
use smoker_monitor::config::Config;
use smoker_monitor::{listener, logging, shutdown};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ListenerArgs::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config);
    config.validate()?;
    logging::init_tracing(&config, "smoker-listener")?;

    let token = CancellationToken::new();
    let signals = shutdown::spawn_signal_handler(token.clone());

    let channel = config.channel(args.channel);
    let result = listener::serve(&config, channel, token.clone()).await;
    token.cancel();
    signals.await.ok();

    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "listener exited");
    }
    logging::shutdown_tracing();
    result.map(|_| ())
}
