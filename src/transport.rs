use crate::errors::ProviderError::{self, *};
use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A bidirectional, message-framed byte channel to the widget surface.
///
/// `recv` must be cancel safe: dropping a pending `recv` never loses a frame.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProviderError>;
    async fn recv(&mut self) -> Result<Vec<u8>, ProviderError>;
}

/// One end of an in-process transport pair.
pub struct MemoryTransport {
    tx: UnboundedSender<Vec<u8>>,
    rx: UnboundedReceiver<Vec<u8>>,
}

/// Two connected in-memory ends; what one sends the other receives.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = unbounded_channel();
    let (b_tx, a_rx) = unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProviderError> {
        self.tx.send(frame.to_vec()).map_err(|_| ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ProviderError> {
        self.rx.recv().await.ok_or(ConnectionClosed)
    }
}
