use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};

/// An entry in the mailbox: either a value or the stop sentinel.
#[derive(Debug)]
enum Letter<T> {
    Item(T),
    Stop,
}

/// Creates a single-slot mailbox. Relies on Tokio's [`mpsc`] channel with a buffer of one.
///
/// The sending half never waits: if the slot is occupied, the offered value is dropped.
/// Only [`MailboxSender::stop`] waits for the slot to free up, so the sentinel is never lost.
pub fn mailbox<T: Send>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);

    (MailboxSender { tx }, MailboxReceiver { rx, stopped: false })
}

/// The sending half of a [`mailbox`].
#[derive(Debug)]
pub struct MailboxSender<T> {
    tx: mpsc::Sender<Letter<T>>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Send> MailboxSender<T> {
    /// Attempts to place a value in the mailbox without waiting.
    ///
    /// Returns `false` if the slot is occupied or the receiver is gone. In both cases the
    /// value is dropped.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(Letter::Item(item)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("mailbox occupied, dropping offered value");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Pushes the stop sentinel, waiting for the slot to free up if needed.
    ///
    /// Returns immediately if the receiver has already been dropped.
    pub async fn stop(&self) {
        let _ = self.tx.send(Letter::Stop).await;
    }

    /// Returns `true` if the receiving half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The receiving half of a [`mailbox`].
#[derive(Debug)]
pub struct MailboxReceiver<T> {
    rx: mpsc::Receiver<Letter<T>>,
    stopped: bool,
}

impl<T> MailboxReceiver<T> {
    /// Waits for the next value.
    ///
    /// Returns `None` once the stop sentinel has been received or every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if self.stopped {
            return None;
        }

        match self.rx.recv().await {
            Some(Letter::Item(item)) => Some(item),
            Some(Letter::Stop) | None => {
                self.stopped = true;
                None
            }
        }
    }

    /// Takes the current value without waiting, if there is one.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.stopped {
            return None;
        }

        match self.rx.try_recv() {
            Ok(Letter::Item(item)) => Some(item),
            Ok(Letter::Stop) | Err(TryRecvError::Disconnected) => {
                self.stopped = true;
                None
            }
            Err(TryRecvError::Empty) => None,
        }
    }
}
