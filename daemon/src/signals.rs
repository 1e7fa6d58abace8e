use std::thread::{self, JoinHandle};

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::node::NodeHandle;

pub struct SignalManager {
    _handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ShutdownSignal {
    receiver: oneshot::Receiver<()>,
}

impl ShutdownSignal {
    pub async fn wait(self) {
        let _ = self.receiver.await;
    }
}

impl SignalManager {
    /// Installs the termination handlers. A termination signal releases
    /// the HTTP listener first; the coordinator itself is closed by main
    /// once in-flight requests have drained, so the apply processor
    /// finishes the command it is on. SIGHUP reports progress; there is
    /// no reloadable state.
    pub fn install(node: NodeHandle) -> Result<(Self, ShutdownSignal)> {
        let signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])?;
        let (tx, rx) = oneshot::channel();

        let handle = thread::spawn(move || {
            let mut signals = signals;
            let mut tx = Some(tx);
            for sig in signals.forever() {
                match sig {
                    SIGTERM | SIGINT | SIGQUIT => {
                        tracing::info!(
                            event = "node.drain",
                            signal = sig,
                            applied_index = node.index(),
                            "releasing listener; coordinator closes after requests drain"
                        );
                        if let Some(sender) = tx.take() {
                            let _ = sender.send(());
                        }
                        break;
                    }
                    SIGHUP => {
                        tracing::info!(
                            event = "node.status",
                            id = node.id(),
                            applied_index = node.index(),
                            "status requested"
                        );
                    }
                    _ => {}
                }
            }
        });

        Ok((Self { _handle: handle }, ShutdownSignal { receiver: rx }))
    }
}
