use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors surfaced across a request boundary. Mostly seen during
/// shutdown, when one half of a conversation has already exited.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum IpcError {
    #[error("receiving task is gone")]
    ReceiverGone,
    #[error("request was dropped before it was replied to")]
    NoReply,
}

/// Creates a bounded request channel between an [`Endpoint`] and the
/// single [`Inbox`] of the owning server task.
pub fn channel<R>(capacity: usize) -> (Endpoint<R>, Inbox<R>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Endpoint { tx }, Inbox { rx })
}

/// The sending side of a server's request channel.
///
/// Requests from any number of endpoints are seen by the server strictly
/// in arrival order, so a server's receive loop is a serial interleaving
/// of handled requests and its state needs no locking.
pub struct Endpoint<R> {
    tx: mpsc::Sender<R>,
}

impl<R> std::fmt::Debug for Endpoint<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

impl<R> Clone for Endpoint<R> {
    fn clone(&self) -> Self {
        Endpoint {
            tx: self.tx.clone(),
        }
    }
}

impl<R: Send> Endpoint<R> {
    /// One-way request. Blocks only while the inbox is full.
    pub async fn cast(&self, request: R) -> Result<(), IpcError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| IpcError::ReceiverGone)
    }

    /// Round-trip request. The closure embeds the reply sender into the
    /// request; the caller stays blocked until the server replies.
    pub async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> R,
    ) -> Result<T, IpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| IpcError::ReceiverGone)?;
        reply_rx.await.map_err(|_| IpcError::NoReply)
    }
}

/// The receiving side, owned by exactly one server task.
pub struct Inbox<R> {
    rx: mpsc::Receiver<R>,
}

impl<R> std::fmt::Debug for Inbox<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").finish_non_exhaustive()
    }
}

impl<R> Inbox<R> {
    /// The next request in arrival order, or `None` once every endpoint
    /// has been dropped.
    pub async fn recv(&mut self) -> Option<R> {
        self.rx.recv().await
    }
}
