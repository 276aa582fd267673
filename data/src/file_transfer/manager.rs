use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU16;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use itertools::Itertools;
use rand::Rng;

use irc::Listener;

use super::{path, task, Checksum, Direction, FileTransfer, Id, Mode, Status, Task};
use crate::user::Nick;
use crate::{config, dcc, server};

pub struct SendRequest {
    pub to: Nick,
    pub path: PathBuf,
    pub passive: bool,
}

pub struct ReceiveRequest {
    pub from: Nick,
    pub dcc_send: dcc::Send,
}

pub enum Event {
    /// A transfer task was spawned; the caller folds its updates into
    /// the main loop.
    RunTask(BoxStream<'static, task::Update>),
}

/// Outcome of an inbound `DCC SEND`.
pub enum Received {
    /// The peer confirmed one of our reverse offers.
    PassiveConfirmed(Id),
    /// New offer recorded, waiting for explicit approval.
    Offered(Id),
    /// New offer auto-accepted.
    Accepted(Id, Event),
}

enum Item {
    /// Inbound offer awaiting approval. No socket exists yet.
    Offered {
        transfer: FileTransfer,
        dcc_send: dcc::Send,
    },
    Working {
        transfer: FileTransfer,
        handle: task::Handle,
    },
    Finished(FileTransfer),
}

impl Item {
    fn transfer(&self) -> &FileTransfer {
        match self {
            Item::Offered { transfer, .. } => transfer,
            Item::Working { transfer, .. } => transfer,
            Item::Finished(transfer) => transfer,
        }
    }

    fn transfer_mut(&mut self) -> &mut FileTransfer {
        match self {
            Item::Offered { transfer, .. } => transfer,
            Item::Working { transfer, .. } => transfer,
            Item::Finished(transfer) => transfer,
        }
    }
}

/// Owns every DCC transfer record; one task per live transfer. Errors
/// stay scoped to the offending transfer and never touch the IRC
/// session.
pub struct Manager {
    config: config::Dcc,
    items: HashMap<Id, Item>,
}

impl Manager {
    pub fn new(config: config::Dcc) -> Self {
        Self {
            config,
            items: HashMap::new(),
        }
    }

    pub fn config(&self) -> &config::Dcc {
        &self.config
    }

    fn get_random_id(&self) -> Id {
        let mut rng = rand::thread_rng();

        loop {
            let id = Id(rng.gen_range(1000..=u32::MAX));

            if !self.items.contains_key(&id) {
                return id;
            }
        }
    }

    fn checksum(&self) -> Option<Checksum> {
        self.config.checksum_verify.then_some(Checksum {
            algorithm: self.config.checksum_algorithm,
            expected: None,
            computed: None,
        })
    }

    fn checksum_algorithm(&self) -> Option<crate::config::ChecksumAlgorithm> {
        self.config
            .checksum_verify
            .then_some(self.config.checksum_algorithm)
    }

    fn advertised_ip(&self, local_ip: Option<IpAddr>) -> IpAddr {
        self.config
            .advertised_ip
            .or(local_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn bind(&self) -> Result<(Listener, NonZeroU16), Error> {
        let listener = Listener::bind(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.port_range_start..=self.config.port_range_end,
        )
        .await?;
        let port =
            NonZeroU16::new(listener.local_addr()?.port()).ok_or(Error::NoPort)?;

        Ok((listener, port))
    }

    /// Offers a local file to a peer. Active offers bind a listener in
    /// the configured port range before the CTCP goes out; passive
    /// offers advertise a zero endpoint plus the transfer id as token.
    pub async fn send(
        &mut self,
        request: SendRequest,
        local_ip: Option<IpAddr>,
        handle: &server::Handle,
    ) -> Result<(Id, Event), Error> {
        if !self.config.enabled {
            return Err(Error::Disabled);
        }

        let metadata = tokio::fs::metadata(&request.path).await?;
        if !metadata.is_file() {
            return Err(Error::NotAFile(request.path));
        }
        let size = metadata.len();

        let filename = request
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::NotAFile(request.path.clone()))?
            .to_string();

        let id = self.get_random_id();

        let (offer, mode, status, token) = if request.passive {
            let token = id.to_string();

            handle.send(
                dcc::Send::Reverse {
                    filename: filename.clone(),
                    size,
                    token: token.clone(),
                }
                .encode(&request.to),
            )?;

            (
                task::Offer::Passive,
                Mode::Passive,
                Status::Pending,
                Some(token),
            )
        } else {
            let (listener, port) = self.bind().await?;

            handle.send(
                dcc::Send::Direct {
                    filename: filename.clone(),
                    host: self.advertised_ip(local_ip),
                    port,
                    size,
                    token: None,
                }
                .encode(&request.to),
            )?;

            (
                task::Offer::Active { listener },
                Mode::Active,
                Status::Negotiating,
                None,
            )
        };

        let now = Utc::now();
        let transfer = FileTransfer {
            id,
            remote_user: request.to,
            filename,
            path: Some(request.path.clone()),
            size,
            transferred: 0,
            direction: Direction::Send,
            mode,
            status,
            checksum: self.checksum(),
            rate_limit: self.config.send_limit_bytes(),
            resume_offset: 0,
            token,
            created_at: now,
            last_progress: now,
        };

        let (task_handle, updates) = Task::Send {
            id,
            path: request.path,
            size,
            offer,
            rate_limit: self.config.send_limit_bytes(),
            deadline: self.config.timeout_duration(),
            checksum: self.checksum_algorithm(),
        }
        .spawn();

        self.items.insert(
            id,
            Item::Working {
                transfer,
                handle: task_handle,
            },
        );

        Ok((id, Event::RunTask(updates.boxed())))
    }

    /// Handles an inbound `DCC SEND`: either the confirmation of one of
    /// our passive offers (matched by token) or a fresh offer from the
    /// peer. Security checks run here, before any socket exists.
    pub async fn receive(
        &mut self,
        request: ReceiveRequest,
        local_ip: Option<IpAddr>,
        handle: &server::Handle,
    ) -> Result<Received, Error> {
        if !self.config.enabled {
            return Err(Error::Disabled);
        }

        let ReceiveRequest { from, dcc_send } = request;

        // Reply to one of our reverse offers?
        if let Some(id) = dcc_send.token().and_then(|t| t.parse().ok().map(Id)) {
            if let dcc::Send::Direct {
                filename,
                host,
                port,
                ..
            } = &dcc_send
            {
                if let Some(Item::Working {
                    transfer,
                    handle: task_handle,
                }) = self.items.get_mut(&id)
                {
                    if transfer.filename == *filename && transfer.remote_user == from {
                        log::debug!("reverse offer {id} confirmed by {from} for {filename:?}");
                        transfer.status = Status::Connecting;
                        transfer.last_progress = Utc::now();
                        task_handle.confirm_reverse(*host, *port);
                        return Ok(Received::PassiveConfirmed(id));
                    }
                }
            }
        }

        log::debug!("transfer offer from {from} for {:?}", dcc_send.filename());

        let id = self.get_random_id();
        let resolved = path::resolve(&self.config, dcc_send.filename(), dcc_send.size());

        let now = Utc::now();
        let mut transfer = FileTransfer {
            id,
            remote_user: from,
            filename: dcc_send.filename().to_string(),
            path: None,
            size: dcc_send.size(),
            transferred: 0,
            direction: Direction::Receive,
            mode: match &dcc_send {
                dcc::Send::Reverse { .. } => Mode::Passive,
                dcc::Send::Direct { .. } => Mode::Active,
            },
            status: Status::Pending,
            checksum: self.checksum(),
            rate_limit: self.config.recv_limit_bytes(),
            resume_offset: 0,
            token: dcc_send.token().map(String::from),
            created_at: now,
            last_progress: now,
        };

        match resolved {
            Ok(path) => transfer.path = Some(path),
            Err(e) => {
                transfer.status = Status::Failed {
                    error: e.to_string(),
                };
                self.items.insert(id, Item::Finished(transfer));
                return Err(Error::Security(e));
            }
        }

        self.items.insert(id, Item::Offered { transfer, dcc_send });

        if self.config.auto_accept {
            let event = self.approve(id, local_ip, handle).await?;
            Ok(Received::Accepted(id, event))
        } else {
            Ok(Received::Offered(id))
        }
    }

    /// Accepts a pending inbound offer: spawns its task and, when a
    /// partial file exists, negotiates resume before any byte flows.
    pub async fn approve(
        &mut self,
        id: Id,
        local_ip: Option<IpAddr>,
        handle: &server::Handle,
    ) -> Result<Event, Error> {
        if !matches!(self.items.get(&id), Some(Item::Offered { .. })) {
            return Err(Error::UnknownTransfer(id));
        }
        let Some(Item::Offered {
            mut transfer,
            dcc_send,
        }) = self.items.remove(&id)
        else {
            return Err(Error::UnknownTransfer(id));
        };

        let save_to = transfer
            .path
            .clone()
            .ok_or(Error::UnknownTransfer(id))?;

        // Resume is negotiated for active offers when a partial file
        // already exists
        let resume_from = if self.config.resume_enabled {
            tokio::fs::metadata(&save_to)
                .await
                .ok()
                .map(|m| m.len())
                .filter(|len| *len > 0 && *len < transfer.size)
                .unwrap_or(0)
        } else {
            0
        };

        let (source, peer_port) = match &dcc_send {
            dcc::Send::Direct { host, port, .. } => (
                task::Source::Direct {
                    host: *host,
                    port: *port,
                },
                Some(port.get()),
            ),
            dcc::Send::Reverse { token, .. } => {
                let (listener, port) = self.bind().await?;

                handle.send(
                    dcc::Send::Direct {
                        filename: transfer.filename.clone(),
                        host: self.advertised_ip(local_ip),
                        port,
                        size: transfer.size,
                        token: Some(token.clone()),
                    }
                    .encode(&transfer.remote_user),
                )?;

                (task::Source::Listener(listener), None)
            }
        };

        let (task_handle, updates) = Task::Receive {
            id,
            size: transfer.size,
            source,
            rate_limit: self.config.recv_limit_bytes(),
            deadline: self.config.timeout_duration(),
            checksum: self.checksum_algorithm(),
        }
        .spawn();

        match peer_port {
            Some(port) if resume_from > 0 => {
                // Hold the task until the sender confirms with ACCEPT
                handle.send(
                    dcc::Transfer {
                        filename: transfer.filename.clone(),
                        port,
                        position: resume_from,
                    }
                    .encode_resume(&transfer.remote_user),
                )?;
                transfer.status = Status::Negotiating;
                transfer.resume_offset = resume_from;
            }
            _ => {
                task_handle.approve(save_to, 0);
                transfer.status = Status::Queued;
            }
        }

        transfer.last_progress = Utc::now();

        self.items.insert(
            id,
            Item::Working {
                transfer,
                handle: task_handle,
            },
        );

        Ok(Event::RunTask(updates.boxed()))
    }

    /// Peer asked to resume one of our outgoing offers: reply ACCEPT
    /// and seek the source file.
    pub fn resume_requested(
        &mut self,
        from: &Nick,
        resume: dcc::Transfer,
        handle: &server::Handle,
    ) -> Result<Id, Error> {
        let found = self.items.iter_mut().find_map(|(id, item)| match item {
            Item::Working { transfer, handle }
                if transfer.direction == Direction::Send
                    && !transfer.status.is_terminal()
                    && transfer.remote_user == *from
                    && transfer.filename == resume.filename =>
            {
                Some((*id, transfer, handle))
            }
            _ => None,
        });

        let Some((id, transfer, task_handle)) = found else {
            return Err(Error::UnknownResume(resume.filename));
        };

        let position = resume.position.min(transfer.size);
        transfer.resume_offset = position;
        transfer.last_progress = Utc::now();

        task_handle.resume_accepted(position);
        handle.send(resume.encode_accept(from))?;

        Ok(id)
    }

    /// Sender confirmed our RESUME: release the held receive task from
    /// the agreed position.
    pub fn resume_accepted(&mut self, from: &Nick, accept: dcc::Transfer) -> Result<Id, Error> {
        let found = self.items.iter_mut().find_map(|(id, item)| match item {
            Item::Working { transfer, handle }
                if transfer.direction == Direction::Receive
                    && transfer.status == Status::Negotiating
                    && transfer.remote_user == *from
                    && transfer.filename == accept.filename =>
            {
                Some((*id, transfer, handle))
            }
            _ => None,
        });

        let Some((id, transfer, task_handle)) = found else {
            return Err(Error::UnknownResume(accept.filename));
        };

        let position = accept.position.min(transfer.resume_offset);
        transfer.resume_offset = position;
        transfer.status = Status::Queued;
        transfer.last_progress = Utc::now();

        if let Some(save_to) = transfer.path.clone() {
            task_handle.approve(save_to, position);
        }

        Ok(id)
    }

    pub fn cancel(&mut self, id: Id) -> Result<(), Error> {
        match self.items.get_mut(&id) {
            Some(Item::Working { handle, .. }) => {
                // The task reports back with Update::Cancelled
                handle.cancel();
                Ok(())
            }
            Some(Item::Offered { .. }) => {
                if let Some(Item::Offered { mut transfer, .. }) = self.items.remove(&id) {
                    transfer.status = Status::Cancelled;
                    transfer.last_progress = Utc::now();
                    self.items.insert(id, Item::Finished(transfer));
                }
                Ok(())
            }
            Some(Item::Finished(_)) | None => Err(Error::UnknownTransfer(id)),
        }
    }

    /// Applies a task update; returns the new record snapshot when it
    /// changed, so the caller can surface it.
    pub fn update(&mut self, update: task::Update) -> Option<FileTransfer> {
        let (id, terminal) = match &update {
            task::Update::Connecting(id) => (*id, false),
            task::Update::Transferring(id) => (*id, false),
            task::Update::Progress { id, .. } => (*id, false),
            task::Update::Finished { id, .. } => (*id, true),
            task::Update::Failed(id, _) => (*id, true),
            task::Update::Cancelled(id) => (*id, true),
        };

        let item = self.items.get_mut(&id)?;
        let transfer = item.transfer_mut();

        if transfer.status.is_terminal() {
            return None;
        }

        transfer.last_progress = Utc::now();

        match update {
            task::Update::Connecting(_) => transfer.status = Status::Connecting,
            task::Update::Transferring(_) => transfer.status = Status::Transferring,
            task::Update::Progress { transferred, .. } => {
                transfer.transferred = transferred.min(transfer.size);
            }
            task::Update::Finished {
                transferred,
                digest,
                ..
            } => {
                transfer.transferred = transferred.min(transfer.size);

                if let (Some(checksum), Some(computed)) = (&mut transfer.checksum, digest) {
                    checksum.computed = Some(computed);

                    if checksum
                        .expected
                        .as_ref()
                        .is_some_and(|expected| Some(expected) != checksum.computed.as_ref())
                    {
                        transfer.status = Status::Failed {
                            error: "checksum mismatch".to_string(),
                        };
                    } else {
                        transfer.status = Status::Completed;
                    }
                } else {
                    transfer.status = Status::Completed;
                }
            }
            task::Update::Failed(_, error) => {
                transfer.status = Status::Failed { error };
            }
            task::Update::Cancelled(_) => transfer.status = Status::Cancelled,
        }

        let snapshot = transfer.clone();

        if snapshot.status.is_terminal() {
            // Drop the task handle; the record stays for history
            let finished = Item::Finished(snapshot.clone());
            self.items.insert(id, finished);
        }

        Some(snapshot)
    }

    /// Periodic eviction: terminal records past the max age are dropped
    /// and stale passive offers expire. Returns transfers whose state
    /// changed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<FileTransfer> {
        let max_age = ChronoDuration::seconds(self.config.transfer_max_age_seconds as i64);
        let token_timeout = ChronoDuration::seconds(self.config.passive_token_timeout as i64);

        let mut expired = vec![];

        for item in self.items.values_mut() {
            let snapshot = item.transfer().clone();

            let stale_passive = snapshot.mode == Mode::Passive
                && snapshot.status == Status::Pending
                && now - snapshot.created_at > token_timeout;

            if stale_passive {
                if let Item::Working { handle, .. } = item {
                    handle.cancel();
                }

                let mut failed = snapshot;
                failed.status = Status::Failed {
                    error: "passive offer expired".to_string(),
                };
                failed.last_progress = now;
                expired.push(failed.clone());
                *item = Item::Finished(failed);
            }
        }

        self.items.retain(|_, item| {
            let transfer = item.transfer();
            !(transfer.status.is_terminal() && now - transfer.last_progress > max_age)
        });

        expired
    }

    pub fn get(&self, id: Id) -> Option<&FileTransfer> {
        self.items.get(&id).map(Item::transfer)
    }

    pub fn list(&self) -> impl Iterator<Item = &'_ FileTransfer> {
        self.items
            .values()
            .map(Item::transfer)
            .sorted_by_key(|t| t.created_at)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dcc is disabled")]
    Disabled,
    #[error("{0}")]
    Security(#[from] path::Error),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("no usable port")]
    NoPort,
    #[error("unknown transfer {0}")]
    UnknownTransfer(Id),
    #[error("no transfer matches resume of {0:?}")]
    UnknownResume(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Connection(#[from] irc::connection::Error),
    #[error(transparent)]
    Send(#[from] server::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config;

    fn manager(dcc: config::Dcc) -> Manager {
        Manager::new(dcc)
    }

    fn transfer(id: u32, status: Status, mode: Mode, age_seconds: i64) -> FileTransfer {
        let at = Utc::now() - ChronoDuration::seconds(age_seconds);
        FileTransfer {
            id: Id(id),
            remote_user: Nick::from("bob"),
            filename: "file.bin".into(),
            path: None,
            size: 100,
            transferred: 0,
            direction: Direction::Receive,
            mode,
            status,
            checksum: None,
            rate_limit: 0,
            resume_offset: 0,
            token: None,
            created_at: at,
            last_progress: at,
        }
    }

    #[test]
    fn sweep_expires_stale_passive_offers() {
        let mut manager = manager(config::Dcc {
            passive_token_timeout: 120,
            ..config::Dcc::default()
        });

        manager.items.insert(
            Id(1),
            Item::Finished(transfer(1, Status::Pending, Mode::Passive, 500)),
        );
        manager.items.insert(
            Id(2),
            Item::Finished(transfer(2, Status::Pending, Mode::Passive, 10)),
        );

        let expired = manager.sweep(Utc::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, Id(1));
        assert!(matches!(
            manager.get(Id(1)).unwrap().status,
            Status::Failed { .. }
        ));
        assert_eq!(manager.get(Id(2)).unwrap().status, Status::Pending);
    }

    #[test]
    fn sweep_evicts_old_terminal_records() {
        let mut manager = manager(config::Dcc {
            transfer_max_age_seconds: 3600,
            ..config::Dcc::default()
        });

        manager.items.insert(
            Id(1),
            Item::Finished(transfer(1, Status::Completed, Mode::Active, 7200)),
        );
        manager.items.insert(
            Id(2),
            Item::Finished(transfer(2, Status::Completed, Mode::Active, 60)),
        );

        manager.sweep(Utc::now());

        assert!(manager.get(Id(1)).is_none());
        assert!(manager.get(Id(2)).is_some());
    }

    #[test]
    fn terminal_updates_freeze_the_record() {
        let mut manager = manager(config::Dcc::default());

        manager.items.insert(
            Id(1),
            Item::Finished(transfer(1, Status::Transferring, Mode::Active, 0)),
        );

        let updated = manager.update(task::Update::Finished {
            id: Id(1),
            transferred: 100,
            elapsed: std::time::Duration::from_secs(1),
            digest: None,
        });
        assert_eq!(updated.unwrap().status, Status::Completed);

        // Further updates are ignored once terminal
        assert!(manager
            .update(task::Update::Failed(Id(1), "late".into()))
            .is_none());
    }
}
