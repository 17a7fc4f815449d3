use tokio::sync::broadcast;

/// A broadcast bus for one kind of event.
///
/// Every server that exposes an *await* API publishes on one of these;
/// every notifier task is a subscription loop that forwards each event
/// into its parent's inbox. Publishing never blocks and never fails;
/// events published while nobody listens are simply gone.
///
/// ```
/// # use trackpilot::runtime::bus::Bus;
/// # tokio_test::block_on(async {
/// let bus = Bus::new(8);
/// let mut sub = bus.subscribe();
/// bus.publish(17u32);
/// assert_eq!(sub.recv().await, Some(17));
/// # });
/// ```
#[derive(Debug)]
pub struct Bus<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Bus {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Bus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Bus { tx }
    }

    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscriber's view of a [`Bus`].
#[derive(Debug)]
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// The next event, or `None` once the bus itself is gone. A slow
    /// subscriber that lagged behind skips the missed events and
    /// continues with the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
