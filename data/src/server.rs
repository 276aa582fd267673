use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use irc::proto::{self, format, Tags};

/// Outbound write queue capacity; sends beyond this fail with
/// [`Error::Backpressured`].
pub const WRITE_QUEUE_CAP: usize = 1024;

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Server(String);

impl Server {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Server {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Server {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Cloneable sender onto the connection's write queue. Lines are
/// emitted on the wire in enqueue order.
#[derive(Debug, Clone)]
pub struct Handle {
    sender: mpsc::Sender<proto::Message>,
    message_tags: Arc<AtomicBool>,
}

pub fn channel() -> (Handle, mpsc::Receiver<proto::Message>) {
    let (sender, receiver) = mpsc::channel(WRITE_QUEUE_CAP);

    (
        Handle {
            sender,
            message_tags: Arc::new(AtomicBool::new(false)),
        },
        receiver,
    )
}

impl Handle {
    /// Set once `message-tags` has been negotiated; lifts the classic
    /// 512-byte line limit.
    pub fn set_message_tags(&self, negotiated: bool) {
        self.message_tags.store(negotiated, Ordering::Relaxed);
    }

    pub fn send(&self, message: proto::Message) -> Result<(), Error> {
        if !self.message_tags.load(Ordering::Relaxed) {
            let untagged = proto::Message {
                tags: Tags::default(),
                ..message.clone()
            };
            let len = format::message(untagged).len();
            if len > proto::BYTE_LIMIT {
                return Err(Error::LineTooLong(len));
            }
        }

        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::Backpressured,
            TrySendError::Closed(_) => Error::Disconnected,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("write queue is full")]
    Backpressured,
    #[error("connection is gone")]
    Disconnected,
    #[error("line of {0} bytes exceeds the 512 byte limit")]
    LineTooLong(usize),
}

#[cfg(test)]
mod test {
    use irc::proto::command;

    use super::*;

    #[test]
    fn backpressure_past_queue_cap() {
        let (handle, _receiver) = channel();

        for _ in 0..WRITE_QUEUE_CAP {
            handle.send(command!("PING", "x")).unwrap();
        }

        assert!(matches!(
            handle.send(command!("PING", "x")),
            Err(Error::Backpressured)
        ));
    }

    #[test]
    fn oversize_line_rejected_until_message_tags() {
        let (handle, _receiver) = channel();

        let long = command!("PRIVMSG", "#chan", "x".repeat(600));
        assert!(matches!(
            handle.send(long.clone()),
            Err(Error::LineTooLong(_))
        ));

        handle.set_message_tags(true);
        handle.send(long).unwrap();
    }
}
