// src/mailbox.rs
//! Principal mailboxes (unbounded, binary user messages).
//!
//! System messages travel on their own channel and are delivered ahead of
//! any queued user payloads, so a kill issued during clash resolution
//! preempts whatever backlog the losing principal still has.

use bytes::Bytes;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// Out-of-band control messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemMessage {
    /// Terminate the principal. The runner exits without draining the
    /// user queue.
    Kill,
}

/// Envelope delivered to a principal: either a user payload (binary blob)
/// or a system message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    User(Bytes),
    System(SystemMessage),
}

/// Sender half of a mailbox.
#[derive(Clone)]
pub struct MailboxSender {
    tx_user: mpsc::UnboundedSender<Bytes>,
    tx_sys: mpsc::UnboundedSender<SystemMessage>,
    /// Count of user messages currently queued.
    counter: Arc<AtomicUsize>,
}

/// Receiver half of a mailbox.
pub struct MailboxReceiver {
    rx_user: mpsc::UnboundedReceiver<Bytes>,
    rx_sys: mpsc::UnboundedReceiver<SystemMessage>,
    counter: Arc<AtomicUsize>,
}

/// Create a new mailbox channel (sender, receiver).
pub fn channel() -> (MailboxSender, MailboxReceiver) {
    let (tx_user, rx_user) = mpsc::unbounded_channel();
    let (tx_sys, rx_sys) = mpsc::unbounded_channel();
    let counter = Arc::new(AtomicUsize::new(0));
    (
        MailboxSender { tx_user, tx_sys, counter: counter.clone() },
        MailboxReceiver { rx_user, rx_sys, counter },
    )
}

impl MailboxSender {
    /// Send user bytes. Fails only when the receiver is gone.
    pub fn send_user(&self, b: Bytes) -> Result<(), Bytes> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        let res = self.tx_user.send(b).map_err(|e| e.0);
        if res.is_err() {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
        res
    }

    /// Send a system message.
    pub fn send_system(&self, s: SystemMessage) -> Result<(), SystemMessage> {
        self.tx_sys.send(s).map_err(|e| e.0)
    }

    /// Number of user messages currently queued for this mailbox.
    pub fn len(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MailboxReceiver {
    /// Await a message, preferring any already-enqueued system message
    /// over queued user payloads.
    pub async fn recv(&mut self) -> Option<Message> {
        if let Ok(sys) = self.rx_sys.try_recv() {
            return Some(Message::System(sys));
        }

        tokio::select! {
            biased;
            sys = self.rx_sys.recv() => sys.map(Message::System),
            user = self.rx_user.recv() => user.map(|b| {
                self.counter.fetch_sub(1, Ordering::SeqCst);
                Message::User(b)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_and_recv() {
        let (tx, mut rx) = channel();
        tx.send_user(Bytes::from_static(b"hello")).unwrap();
        let got = rx.recv().await.expect("should receive");
        match got {
            Message::User(buf) => assert_eq!(buf.as_ref(), b"hello"),
            _ => panic!("expected user message"),
        }
    }

    #[tokio::test]
    async fn kill_preempts_queued_user_messages() {
        let (tx, mut rx) = channel();
        tx.send_user(Bytes::from_static(b"m1")).unwrap();
        tx.send_user(Bytes::from_static(b"m2")).unwrap();
        tx.send_system(SystemMessage::Kill).unwrap();

        // The kill went in last but must come out first.
        let first = rx.recv().await.expect("first");
        assert_eq!(first, Message::System(SystemMessage::Kill));

        let second = rx.recv().await.expect("second");
        match second {
            Message::User(b) => assert_eq!(b.as_ref(), b"m1"),
            _ => panic!("expected user message"),
        }
    }

    #[tokio::test]
    async fn counter_tracks_queue_depth() {
        let (tx, mut rx) = channel();
        assert_eq!(tx.len(), 0);
        tx.send_user(Bytes::from_static(b"a")).unwrap();
        tx.send_user(Bytes::from_static(b"b")).unwrap();
        assert_eq!(tx.len(), 2);
        let _ = rx.recv().await;
        assert_eq!(tx.len(), 1);
    }
}
