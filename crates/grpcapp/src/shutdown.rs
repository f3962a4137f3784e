use std::fmt;
use tokio::{signal, sync::mpsc};

/// What started a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT, or Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Interrupt => "interrupt",
            Signal::Terminate => "terminated",
        })
    }
}

/// Triggers the same graceful shutdown an OS signal would.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<Signal>,
}

impl ShutdownHandle {
    pub(crate) fn new(tx: mpsc::Sender<Signal>) -> Self {
        Self { tx }
    }

    /// Requests shutdown. Returns `false` when a shutdown was already
    /// requested or the application has stopped.
    pub fn trigger(&self, signal: Signal) -> bool {
        self.tx.try_send(signal).is_ok()
    }
}

/// Shutdown sources, registered up front so a signal arriving before anyone
/// waits is not lost.
pub(crate) struct Signals {
    #[cfg(unix)]
    interrupt: Option<signal::unix::Signal>,
    #[cfg(unix)]
    terminate: Option<signal::unix::Signal>,
    trigger: Option<mpsc::Receiver<Signal>>,
}

impl Signals {
    /// Registers the SIGINT and SIGTERM handlers. Must run inside a tokio
    /// runtime.
    pub(crate) fn install(trigger: Option<mpsc::Receiver<Signal>>) -> Self {
        Self {
            #[cfg(unix)]
            interrupt: unix_signal(signal::unix::SignalKind::interrupt(), "SIGINT"),
            #[cfg(unix)]
            terminate: unix_signal(signal::unix::SignalKind::terminate(), "SIGTERM"),
            trigger,
        }
    }

    /// Waits for the first SIGINT/SIGTERM or programmatic trigger.
    pub(crate) async fn recv(self) -> Signal {
        let Signals {
            #[cfg(unix)]
            interrupt,
            #[cfg(unix)]
            terminate,
            trigger,
        } = self;

        #[cfg(unix)]
        let interrupt = recv_unix(interrupt);
        #[cfg(not(unix))]
        let interrupt = async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = recv_unix(terminate);
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let triggered = async {
            match trigger {
                Some(mut rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = interrupt => Signal::Interrupt,
            () = terminate => Signal::Terminate,
            Some(signal) = triggered => signal,
        }
    }
}

#[cfg(unix)]
fn unix_signal(
    kind: signal::unix::SignalKind,
    name: &'static str,
) -> Option<signal::unix::Signal> {
    signal::unix::signal(kind)
        .inspect_err(|err| {
            tracing::error!(error = %err, signal = name, "failed to install signal handler")
        })
        .ok()
}

#[cfg(unix)]
async fn recv_unix(stream: Option<signal::unix::Signal>) {
    match stream {
        Some(mut stream) => {
            stream.recv().await;
        }
        None => std::future::pending().await,
    }
}
