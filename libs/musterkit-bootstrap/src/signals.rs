//! Shutdown coordinator.
//!
//! [`SignalHandler::run`] blocks until a termination signal arrives or
//! [`SignalHandler::stop`] is called. On termination every registered
//! [`SignalReceiver`] is told to stop first. A diagnostic signal (SIGQUIT on
//! unix) logs a dump and keeps waiting.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Something that must be stopped when a termination signal arrives.
pub trait SignalReceiver: Send + Sync {
    fn stop(&self) -> Result<()>;
}

/// Signals the coordinator reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT / SIGTERM / Ctrl+C.
    Terminate,
    /// SIGQUIT.
    Dump,
}

/// Extra text appended to diagnostic dumps.
pub type DiagnosticsFn = Arc<dyn Fn() -> String + Send + Sync>;

pub struct SignalHandler {
    receivers: Vec<Arc<dyn SignalReceiver>>,
    quit: CancellationToken,
    diagnostics: Option<DiagnosticsFn>,
}

impl SignalHandler {
    pub fn new(receivers: Vec<Arc<dyn SignalReceiver>>) -> Self {
        Self {
            receivers,
            quit: CancellationToken::new(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.diagnostics = Some(Arc::new(diagnostics));
        self
    }

    /// Unblock [`SignalHandler::run`] without a signal. Idempotent.
    pub fn stop(&self) {
        self.quit.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Wait for OS signals until a termination signal arrives or the handler
    /// is stopped.
    pub async fn run(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel(4);
        let forwarder = tokio::spawn(forward_os_signals(os_signals()?, tx));
        let result = self.run_with(rx).await;
        forwarder.abort();
        result
    }

    /// Like [`SignalHandler::run`], with signals read from `signals`.
    pub async fn run_with(&self, mut signals: mpsc::Receiver<Signal>) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.quit.cancelled() => return Ok(()),
                signal = signals.recv() => match signal {
                    Some(Signal::Terminate) => {
                        tracing::info!("=== received termination signal, exiting ===");
                        for receiver in &self.receivers {
                            if let Err(e) = receiver.stop() {
                                tracing::warn!(error = %e, "error stopping signal receiver");
                            }
                        }
                        self.quit.cancel();
                        return Ok(());
                    }
                    Some(Signal::Dump) => self.dump(),
                    None => {
                        self.quit.cancelled().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    fn dump(&self) {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let runtime = tokio::runtime::Handle::try_current()
            .map(|handle| {
                let metrics = handle.metrics();
                format!(
                    "workers={} alive_tasks={}",
                    metrics.num_workers(),
                    metrics.num_alive_tasks()
                )
            })
            .unwrap_or_else(|_| "no runtime".to_string());
        let extra = self
            .diagnostics
            .as_ref()
            .map(|diagnostics| diagnostics())
            .unwrap_or_default();

        tracing::info!(
            %runtime,
            "=== received SIGQUIT ===\n{extra}\n*** backtrace ***\n{backtrace}\n*** end ***"
        );
    }
}

#[cfg(unix)]
struct OsSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
fn os_signals() -> Result<OsSignals> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    Ok(OsSignals {
        interrupt: signal(SignalKind::interrupt()).context("installing SIGINT handler")?,
        terminate: signal(SignalKind::terminate()).context("installing SIGTERM handler")?,
        quit: signal(SignalKind::quit()).context("installing SIGQUIT handler")?,
    })
}

#[cfg(unix)]
async fn forward_os_signals(mut os: OsSignals, tx: mpsc::Sender<Signal>) {
    loop {
        let signal = tokio::select! {
            Some(()) = os.interrupt.recv() => Signal::Terminate,
            Some(()) = os.terminate.recv() => Signal::Terminate,
            Some(()) = os.quit.recv() => Signal::Dump,
            else => return,
        };
        if tx.send(signal).await.is_err() {
            return;
        }
    }
}

#[cfg(not(unix))]
struct OsSignals;

#[cfg(not(unix))]
fn os_signals() -> Result<OsSignals> {
    Ok(OsSignals)
}

#[cfg(not(unix))]
async fn forward_os_signals(_os: OsSignals, tx: mpsc::Sender<Signal>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if tx.send(Signal::Terminate).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl SignalReceiver for Counting {
        fn stop(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_twice_is_harmless() {
        let handler = SignalHandler::new(Vec::new());
        handler.stop();
        handler.stop();
        assert!(handler.is_stopped());

        let (_tx, rx) = mpsc::channel(1);
        timeout(WAIT, handler.run_with(rx)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn programmatic_stop_unblocks_run() {
        let handler = Arc::new(SignalHandler::new(Vec::new()));
        let (_tx, rx) = mpsc::channel(1);

        let running = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.run_with(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!running.is_finished());

        handler.stop();
        timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn rapid_terminate_signals_stop_receivers_once() {
        let counting = Arc::new(Counting::default());
        let handler = SignalHandler::new(vec![counting.clone() as Arc<dyn SignalReceiver>]);

        let (tx, rx) = mpsc::channel(4);
        tx.send(Signal::Terminate).await.unwrap();
        tx.send(Signal::Terminate).await.unwrap();

        timeout(WAIT, handler.run_with(rx)).await.unwrap().unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert!(handler.is_stopped());

        // a second wait does not start another shutdown
        let (tx, rx) = mpsc::channel(1);
        tx.send(Signal::Terminate).await.unwrap();
        timeout(WAIT, handler.run_with(rx)).await.unwrap().unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dump_keeps_waiting() {
        let dumps = Arc::new(AtomicUsize::new(0));
        let handler = {
            let dumps = Arc::clone(&dumps);
            SignalHandler::new(Vec::new()).with_diagnostics(move || {
                dumps.fetch_add(1, Ordering::SeqCst);
                "modules: 3 Running".to_string()
            })
        };

        let (tx, rx) = mpsc::channel(4);
        tx.send(Signal::Dump).await.unwrap();
        tx.send(Signal::Dump).await.unwrap();
        tx.send(Signal::Terminate).await.unwrap();

        timeout(WAIT, handler.run_with(rx)).await.unwrap().unwrap();
        assert_eq!(dumps.load(Ordering::SeqCst), 2);
    }
}
