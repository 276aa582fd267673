use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::config::ChecksumAlgorithm;
use crate::store::TransferSummary;
use crate::user::Nick;

pub use self::manager::Manager;
pub use self::task::Task;

pub mod manager;
pub mod path;
pub mod task;

/// Opaque transfer id; doubles as the token on passive offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub u32);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => "send".fmt(f),
            Direction::Receive => "receive".fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Active,
    Passive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Pending,
    Queued,
    Negotiating,
    Connecting,
    Transferring,
    Completed,
    Failed { error: String },
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed { .. } | Status::Cancelled
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => "pending".fmt(f),
            Status::Queued => "queued".fmt(f),
            Status::Negotiating => "negotiating".fmt(f),
            Status::Connecting => "connecting".fmt(f),
            Status::Transferring => "transferring".fmt(f),
            Status::Completed => "completed".fmt(f),
            Status::Failed { error } => write!(f, "failed: {error}"),
            Status::Cancelled => "cancelled".fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub expected: Option<String>,
    pub computed: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub id: Id,
    pub remote_user: Nick,
    pub filename: String,
    /// Resolved local path; always inside the download directory for
    /// receives.
    pub path: Option<PathBuf>,
    pub size: u64,
    pub transferred: u64,
    pub direction: Direction,
    pub mode: Mode,
    pub status: Status,
    pub checksum: Option<Checksum>,
    /// Bytes per second; 0 is unlimited.
    pub rate_limit: u64,
    pub resume_offset: u64,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_progress: DateTime<Utc>,
}

impl FileTransfer {
    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            id: self.id.to_string(),
            peer: self.remote_user.to_string(),
            filename: self.filename.clone(),
            size: self.size,
            transferred: self.transferred,
            direction: self.direction.to_string(),
            status: self.status.to_string(),
            finished_at: self.last_progress,
        }
    }
}
