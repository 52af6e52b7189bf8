use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels `token` on SIGINT, or SIGTERM on unix.
///
/// The handlers are installed before this returns, so a signal that arrives while the caller
/// is still connecting is not lost. Must be called from inside a runtime.
pub fn spawn_signal_handler(token: CancellationToken) -> JoinHandle<()> {
    let mut signals = Signals::register();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            signal = signals.recv() => {
                tracing::info!(signal, "shutdown signal received");
            }
        }
        token.cancel();
    })
}

#[cfg(unix)]
struct Signals {
    interrupt: Option<tokio::signal::unix::Signal>,
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl Signals {
    fn register() -> Self {
        use tokio::signal::unix::SignalKind;

        Self {
            interrupt: listen(SignalKind::interrupt(), "SIGINT"),
            terminate: listen(SignalKind::terminate(), "SIGTERM"),
        }
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = next(&mut self.interrupt) => "SIGINT",
            _ = next(&mut self.terminate) => "SIGTERM",
        }
    }
}

#[cfg(unix)]
fn listen(
    kind: tokio::signal::unix::SignalKind,
    name: &'static str,
) -> Option<tokio::signal::unix::Signal> {
    match tokio::signal::unix::signal(kind) {
        Ok(signal) => Some(signal),
        Err(err) => {
            tracing::warn!(error = %err, signal = name, "failed to register signal handler");
            None
        }
    }
}

/// Resolves on the next signal; never resolves for a handler that failed to register.
#[cfg(unix)]
async fn next(signal: &mut Option<tokio::signal::unix::Signal>) {
    if let Some(signal) = signal {
        if signal.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> Self {
        Signals
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    }
}
