use tokio::sync::watch;

/// Host-owned "network connected" flag.
///
/// The host flips it from its platform callbacks; queues only observe it.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    tx: watch::Sender<bool>,
}

impl ConnectivitySignal {
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self { tx }
    }

    /// Record the current connectivity. Observers are only woken on an actual change.
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::new(false)
    }
}
