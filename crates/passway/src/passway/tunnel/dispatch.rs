//! Sequential consumer of the signal queue.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::passway::{
    endpoint::DataDialAddr,
    telemetry,
    tunnel::{
        forward::{Forwarder, SessionKind},
        signal::{SessionId, Signal, SignalError, SignalReceiver},
        tasks::TaskGroup,
    },
};

/// Why the dispatch loop ended.
#[derive(Debug)]
pub enum DispatchExit {
    Cancelled,
    /// Every sender is gone; the read loop has finished.
    QueueClosed,
    /// A signal failed to decode; nothing after it was processed.
    Corrupt(SignalError),
}

pub struct Dispatcher {
    rx: SignalReceiver,
    data_addr: Arc<DataDialAddr>,
    forwarder: Arc<Forwarder>,
    tasks: TaskGroup,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        rx: SignalReceiver,
        data_addr: Arc<DataDialAddr>,
        forwarder: Arc<Forwarder>,
        tasks: TaskGroup,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            data_addr,
            forwarder,
            tasks,
            cancel,
        }
    }

    pub async fn run(mut self) -> DispatchExit {
        let exit = loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break DispatchExit::Cancelled,
                line = self.rx.recv() => match line {
                    Some(line) => line,
                    None => break DispatchExit::QueueClosed,
                },
            };

            if let Err(err) = self.handle(&line) {
                metrics::counter!(telemetry::SIGNAL_DECODE_ERRORS).increment(1);
                tracing::error!(signal = %line, err = %err, "dispatch: corrupt control signal; dispatcher stopped");
                break DispatchExit::Corrupt(err);
            }
        };

        // Later offers see a closed queue; whatever is still buffered is discarded.
        self.rx.close();
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        tracing::debug!(exit = ?exit, discarded, "dispatch: stopped");
        exit
    }

    fn handle(&self, line: &str) -> Result<(), SignalError> {
        match line.parse::<Signal>()? {
            Signal::SetRemotePort(port) => {
                let prev = self.data_addr.set_port(port);
                tracing::info!(prev, port, "dispatch: data port updated");
            }
            Signal::OpenTcpSession(id) => self.spawn_forward(SessionKind::Tcp, id),
            Signal::OpenUdpSession(id) => self.spawn_forward(SessionKind::Udp, id),
            Signal::Unknown { scheme } => {
                tracing::trace!(scheme = %scheme, "dispatch: ignoring unknown signal");
            }
        }
        Ok(())
    }

    fn spawn_forward(&self, kind: SessionKind, id: SessionId) {
        tracing::debug!(session = %id, proto = kind.as_str(), "dispatch: session requested");

        let forwarder = self.forwarder.clone();
        let cancel = self.cancel.clone();
        let spawned = self
            .tasks
            .spawn(async move { forwarder.run(kind, id, cancel).await });
        if !spawned {
            tracing::debug!(proto = kind.as_str(), "dispatch: shutting down; session dropped");
        }
    }
}
