use std::io::SeekFrom;
use std::net::IpAddr;
use std::num::NonZeroU16;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, SinkExt, Stream, StreamExt};
use md5::Md5;
use sha2::{Digest as _, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use irc::{connection, BytesCodec, Connection, Listener};

use super::Id;
use crate::config::ChecksumAlgorithm;

/// Transfers proceed in bounded chunks, yielding between each so a
/// single transfer cannot starve the loop.
pub const CHUNK_SIZE: usize = 16 * 1024;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Handle {
    sender: mpsc::Sender<Action>,
    task: JoinHandle<()>,
}

impl Handle {
    pub fn approve(&self, save_to: PathBuf, resume_from: u64) {
        let _ = self.sender.try_send(Action::Approve {
            save_to,
            resume_from,
        });
    }

    pub fn confirm_reverse(&self, host: IpAddr, port: NonZeroU16) {
        let _ = self.sender.try_send(Action::ReverseConfirmed { host, port });
    }

    pub fn resume_accepted(&self, position: u64) {
        let _ = self.sender.try_send(Action::ResumeAccepted { position });
    }

    pub fn cancel(&self) {
        let _ = self.sender.try_send(Action::Cancel);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// How an outgoing transfer reaches its peer.
pub enum Offer {
    /// We listen and the advertised peer connects.
    Active { listener: Listener },
    /// Reverse offer; we dial once the peer confirms an endpoint.
    Passive,
}

/// Where an incoming transfer's bytes come from.
pub enum Source {
    /// Active offer from the peer; we dial.
    Direct { host: IpAddr, port: NonZeroU16 },
    /// Our reply to a passive offer; we listen.
    Listener(Listener),
}

pub enum Task {
    Send {
        id: Id,
        path: PathBuf,
        size: u64,
        offer: Offer,
        rate_limit: u64,
        deadline: Duration,
        checksum: Option<ChecksumAlgorithm>,
    },
    Receive {
        id: Id,
        size: u64,
        source: Source,
        rate_limit: u64,
        deadline: Duration,
        checksum: Option<ChecksumAlgorithm>,
    },
}

impl Task {
    pub fn spawn(self) -> (Handle, impl Stream<Item = Update>) {
        let (action_sender, action_receiver) = mpsc::channel(4);
        let (update_sender, update_receiver) = mpsc::channel(64);

        let task = tokio::spawn(run(self, action_receiver, update_sender));

        (
            Handle {
                sender: action_sender,
                task,
            },
            ReceiverStream::new(update_receiver),
        )
    }
}

#[derive(Debug)]
pub enum Action {
    Approve { save_to: PathBuf, resume_from: u64 },
    ReverseConfirmed { host: IpAddr, port: NonZeroU16 },
    ResumeAccepted { position: u64 },
    Cancel,
}

#[derive(Debug, Clone)]
pub enum Update {
    Connecting(Id),
    Transferring(Id),
    Progress {
        id: Id,
        transferred: u64,
        elapsed: Duration,
    },
    Finished {
        id: Id,
        transferred: u64,
        elapsed: Duration,
        digest: Option<String>,
    },
    Failed(Id, String),
    Cancelled(Id),
}

async fn run(task: Task, actions: mpsc::Receiver<Action>, updates: mpsc::Sender<Update>) {
    let id = match &task {
        Task::Send { id, .. } => *id,
        Task::Receive { id, .. } => *id,
    };

    let result = match task {
        Task::Send {
            id,
            path,
            size,
            offer,
            rate_limit,
            deadline,
            checksum,
        } => {
            send(
                id, path, size, offer, rate_limit, deadline, checksum, actions, &updates,
            )
            .await
        }
        Task::Receive {
            id,
            size,
            source,
            rate_limit,
            deadline,
            checksum,
        } => {
            receive(
                id, size, source, rate_limit, deadline, checksum, actions, &updates,
            )
            .await
        }
    };

    match result {
        Ok(()) => {}
        Err(Error::Cancelled) => {
            let _ = updates.send(Update::Cancelled(id)).await;
        }
        Err(e) => {
            let _ = updates.send(Update::Failed(id, e.to_string())).await;
        }
    }
}

async fn send(
    id: Id,
    path: PathBuf,
    size: u64,
    offer: Offer,
    rate_limit: u64,
    deadline: Duration,
    checksum: Option<ChecksumAlgorithm>,
    mut actions: mpsc::Receiver<Action>,
    updates: &mpsc::Sender<Update>,
) -> Result<(), Error> {
    let _ = updates.send(Update::Connecting(id)).await;

    let handshake_deadline = Instant::now() + deadline;
    let mut resume_offset = 0u64;

    let mut connection = match offer {
        Offer::Active { listener } => {
            let accept = listener.accept(BytesCodec::new());
            tokio::pin!(accept);

            loop {
                tokio::select! {
                    connection = &mut accept => break connection?,
                    action = actions.recv() => match action {
                        // RESUME may arrive before the peer connects
                        Some(Action::ResumeAccepted { position }) => {
                            resume_offset = position.min(size);
                        }
                        Some(Action::Cancel) | None => return Err(Error::Cancelled),
                        Some(_) => {}
                    },
                    _ = tokio::time::sleep_until(handshake_deadline) => {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
        Offer::Passive => loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(Action::ReverseConfirmed { host, port }) => {
                        break Connection::new(
                            connection::Config {
                                server: &host.to_string(),
                                port: port.get(),
                                security: connection::Security::Unsecured,
                            },
                            BytesCodec::new(),
                        )
                        .await?;
                    }
                    Some(Action::ResumeAccepted { position }) => {
                        resume_offset = position.min(size);
                    }
                    Some(Action::Cancel) | None => return Err(Error::Cancelled),
                    Some(_) => {}
                },
                _ = tokio::time::sleep_until(handshake_deadline) => {
                    return Err(Error::Timeout);
                }
            }
        },
    };

    let mut file = File::open(&path).await?;
    if resume_offset > 0 {
        file.seek(SeekFrom::Start(resume_offset)).await?;
    }

    let _ = updates.send(Update::Transferring(id)).await;

    let started = Instant::now();
    let mut limiter = RateLimiter::new(rate_limit);
    // A resumed transfer can not be hashed from the middle
    let mut digest = checksum.filter(|_| resume_offset == 0).map(Digest::new);
    let mut transferred = resume_offset;
    let mut last_progress = started;
    let mut buffer = vec![0u8; CHUNK_SIZE];

    while transferred < size {
        if let Ok(Action::Cancel) = actions.try_recv() {
            return Err(Error::Cancelled);
        }

        let want = (size - transferred).min(CHUNK_SIZE as u64) as usize;
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: transferred,
            });
        }

        limiter.acquire(n as u64).await;

        if let Some(digest) = &mut digest {
            digest.update(&buffer[..n]);
        }

        connection.send(Bytes::copy_from_slice(&buffer[..n])).await?;
        transferred += n as u64;

        // Opportunistically drain the receiver's acks so its window
        // never fills
        while let Some(Some(_)) = connection.next().now_or_never() {}

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            let _ = updates
                .send(Update::Progress {
                    id,
                    transferred,
                    elapsed: started.elapsed(),
                })
                .await;
            last_progress = Instant::now();
        }
    }

    SinkExt::<Bytes>::flush(&mut connection).await?;
    let _ = connection.shutdown().await;

    let _ = updates
        .send(Update::Finished {
            id,
            transferred,
            elapsed: started.elapsed(),
            digest: digest.map(Digest::finalize_hex),
        })
        .await;

    Ok(())
}

async fn receive(
    id: Id,
    size: u64,
    source: Source,
    rate_limit: u64,
    deadline: Duration,
    checksum: Option<ChecksumAlgorithm>,
    mut actions: mpsc::Receiver<Action>,
    updates: &mpsc::Sender<Update>,
) -> Result<(), Error> {
    let handshake_deadline = Instant::now() + deadline;

    // Nothing happens until the transfer is approved
    let (save_to, resume_from) = loop {
        tokio::select! {
            action = actions.recv() => match action {
                Some(Action::Approve { save_to, resume_from }) => {
                    break (save_to, resume_from);
                }
                Some(Action::Cancel) | None => return Err(Error::Cancelled),
                Some(_) => {}
            },
            _ = tokio::time::sleep_until(handshake_deadline) => {
                return Err(Error::Timeout);
            }
        }
    };

    let _ = updates.send(Update::Connecting(id)).await;

    let mut connection = match source {
        Source::Direct { host, port } => {
            let host_string = host.to_string();
            let connect = Connection::new(
                connection::Config {
                    server: &host_string,
                    port: port.get(),
                    security: connection::Security::Unsecured,
                },
                BytesCodec::new(),
            );

            tokio::select! {
                connection = connect => connection?,
                _ = tokio::time::sleep_until(handshake_deadline) => {
                    return Err(Error::Timeout);
                }
            }
        }
        Source::Listener(listener) => {
            let accept = listener.accept(BytesCodec::new());
            tokio::pin!(accept);

            tokio::select! {
                connection = &mut accept => connection?,
                _ = tokio::time::sleep_until(handshake_deadline) => {
                    return Err(Error::Timeout);
                }
            }
        }
    };

    if let Some(parent) = save_to.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = if resume_from > 0 {
        let mut file = OpenOptions::new().write(true).open(&save_to).await?;
        file.seek(SeekFrom::Start(resume_from)).await?;
        file
    } else {
        File::create(&save_to).await?
    };

    let _ = updates.send(Update::Transferring(id)).await;

    let started = Instant::now();
    let mut limiter = RateLimiter::new(rate_limit);
    // A resumed file can not be hashed from the middle
    let mut digest = checksum.filter(|_| resume_from == 0).map(Digest::new);
    let mut transferred = resume_from;
    let mut last_progress = started;

    while transferred < size {
        let bytes = tokio::select! {
            bytes = tokio::time::timeout(STALL_TIMEOUT, connection.next()) => {
                match bytes.map_err(|_| Error::Timeout)? {
                    Some(bytes) => bytes?,
                    None => {
                        return Err(Error::ClosedEarly {
                            expected: size,
                            actual: transferred,
                        });
                    }
                }
            }
            action = actions.recv() => match action {
                Some(Action::Cancel) | None => return Err(Error::Cancelled),
                Some(_) => continue,
            },
        };

        limiter.acquire(bytes.len() as u64).await;

        if let Some(digest) = &mut digest {
            digest.update(&bytes);
        }

        file.write_all(&bytes).await?;
        transferred += bytes.len() as u64;

        // Positional ack, truncated to 32 bits per the protocol
        let ack = Bytes::from_iter(((transferred & 0xFFFF_FFFF) as u32).to_be_bytes());
        connection.send(ack).await?;

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            let _ = updates
                .send(Update::Progress {
                    id,
                    transferred,
                    elapsed: started.elapsed(),
                })
                .await;
            last_progress = Instant::now();
        }
    }

    file.flush().await?;
    let _ = connection.shutdown().await;

    let _ = updates
        .send(Update::Finished {
            id,
            transferred,
            elapsed: started.elapsed(),
            digest: digest.map(Digest::finalize_hex),
        })
        .await;

    Ok(())
}

/// Token bucket: one second of burst, refilled continuously.
struct RateLimiter {
    rate: u64,
    available: f64,
    last: Instant,
}

impl RateLimiter {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            available: rate as f64,
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        let capacity = (self.rate as f64).max(CHUNK_SIZE as f64);
        self.available = (self.available + elapsed * self.rate as f64).min(capacity);
        self.last = now;
    }

    async fn acquire(&mut self, bytes: u64) {
        if self.rate == 0 {
            return;
        }

        self.refill();

        if self.available < bytes as f64 {
            let deficit = bytes as f64 - self.available;
            let wait = deficit / self.rate as f64;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            self.refill();
        }

        self.available -= bytes as f64;
    }
}

enum Digest {
    Sha256(Sha256),
    Md5(Md5),
}

impl Digest {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Digest::Sha256(Sha256::new()),
            ChecksumAlgorithm::Md5 => Digest::Md5(Md5::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Digest::Sha256(digest) => digest.update(bytes),
            Digest::Md5(digest) => digest.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        let bytes = match self {
            Digest::Sha256(digest) => digest.finalize().to_vec(),
            Digest::Md5(digest) => digest.finalize().to_vec(),
        };

        bytes.iter().fold(String::new(), |mut out, b| {
            use std::fmt::Write;
            let _ = write!(&mut out, "{b:02x}");
            out
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("connection error: {0}")]
    Connection(#[from] connection::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("file ended early ({actual} of {expected} bytes)")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("peer closed the connection early ({actual} of {expected} bytes)")]
    ClosedEarly { expected: u64, actual: u64 },
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use futures::StreamExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_paces_chunks() {
        let rate = CHUNK_SIZE as u64;
        let mut limiter = RateLimiter::new(rate);

        let started = Instant::now();

        // First chunk rides the initial burst; the next two must wait
        // a second each
        limiter.acquire(rate).await;
        limiter.acquire(rate).await;
        limiter.acquire(rate).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "elapsed {elapsed:?}");
    }

    #[test]
    fn digest_hex() {
        let mut digest = Digest::new(ChecksumAlgorithm::Sha256);
        digest.update(b"abc");
        assert_eq!(
            digest.finalize_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let mut digest = Digest::new(ChecksumAlgorithm::Md5);
        digest.update(b"abc");
        assert_eq!(digest.finalize_hex(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn loopback_send_and_receive() {
        let dir = tempfile::tempdir().unwrap();

        let source = dir.path().join("source.bin");
        let payload = (0..40_000u32).flat_map(u32::to_le_bytes).collect::<Vec<_>>();
        tokio::fs::write(&source, &payload).await.unwrap();

        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let listener = Listener::bind(localhost, 0..=0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let send_task = Task::Send {
            id: Id(1),
            path: source,
            size: payload.len() as u64,
            offer: Offer::Active { listener },
            rate_limit: 0,
            deadline: Duration::from_secs(10),
            checksum: Some(ChecksumAlgorithm::Sha256),
        };

        let receive_task = Task::Receive {
            id: Id(2),
            size: payload.len() as u64,
            source: Source::Direct {
                host: localhost,
                port: NonZeroU16::new(port).unwrap(),
            },
            rate_limit: 0,
            deadline: Duration::from_secs(10),
            checksum: Some(ChecksumAlgorithm::Sha256),
        };

        let (_send_handle, send_updates) = send_task.spawn();
        let (receive_handle, receive_updates) = receive_task.spawn();

        let destination = dir.path().join("dest.bin");
        receive_handle.approve(destination.clone(), 0);

        async fn finished(updates: impl Stream<Item = Update>) -> (u64, Option<String>) {
            let mut updates = std::pin::pin!(updates);
            loop {
                match updates.next().await {
                    Some(Update::Finished {
                        transferred,
                        digest,
                        ..
                    }) => break (transferred, digest),
                    Some(Update::Failed(_, error)) => panic!("transfer failed: {error}"),
                    Some(_) => {}
                    None => panic!("updates ended without completion"),
                }
            }
        }

        let ((sent, sent_digest), (received, received_digest)) =
            tokio::join!(finished(send_updates), finished(receive_updates));

        assert_eq!(sent, payload.len() as u64);
        assert_eq!(received, payload.len() as u64);
        assert_eq!(sent_digest, received_digest);
        assert!(sent_digest.is_some());

        let written = tokio::fs::read(&destination).await.unwrap();
        assert_eq!(written, payload);
    }
}
