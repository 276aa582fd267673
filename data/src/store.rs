use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, io};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context;

/// Persisted document schema version.
const SCHEMA_VERSION: u32 = 1;

pub const KEY_CONNECTION_INFO: &str = "connection_info";
pub const KEY_CONNECTION_STATE: &str = "connection_state";
pub const KEY_LAST_SERVER: &str = "last_server";

/// Keys only the connection orchestrator may write.
const RESERVED_KEYS: &[&str] = &[KEY_CONNECTION_STATE];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ConfigError,
    Connecting,
    CapNegotiating,
    Authenticating,
    Registering,
    Registered,
    Ready,
    Disconnecting,
    Error,
}

/// Everything needed to reach and register with a server. Secrets are
/// write-only at use and stripped from persistence unless explicitly
/// enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub verify_tls: bool,
    pub nick: String,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub server_password: Option<String>,
    pub nickserv_password: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub channels: Vec<String>,
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_errors: Vec<String>,
}

impl ConnectionInfo {
    /// Revalidates, repopulating `config_errors`. Returns whether the
    /// configuration is usable.
    pub fn validate(&mut self) -> bool {
        self.config_errors.clear();

        if self.server.is_empty() {
            self.config_errors.push("server address is required".into());
        }
        if self.port == 0 {
            self.config_errors.push("port must be between 1 and 65535".into());
        }
        if self.nick.is_empty() {
            self.config_errors.push("nickname is required".into());
        }
        for channel in &self.channels {
            if channel.contains(',') {
                self.config_errors
                    .push(format!("channel name {channel:?} must not contain a comma"));
            }
        }
        if self.sasl_username.is_some() && self.sasl_password.is_none() {
            self.config_errors
                .push("sasl username provided but no password".into());
        }

        self.config_errors.is_empty()
    }

    pub fn sasl_credentials(&self) -> Option<(String, String)> {
        match (&self.sasl_username, &self.sasl_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            // NickServ password doubles as the SASL secret, as most
            // networks accept it for the configured nick
            (None, _) => self
                .nickserv_password
                .clone()
                .map(|pass| (self.nick.clone(), pass)),
            _ => None,
        }
    }

    fn without_secrets(&self) -> Self {
        Self {
            server_password: None,
            nickserv_password: None,
            sasl_password: None,
            ..self.clone()
        }
    }
}

/// A committed mutation, delivered to subscribers as `(old, new)`.
#[derive(Debug, Clone)]
pub struct Change {
    pub key: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub at: DateTime<Utc>,
}

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;
type SyncHandler = Arc<dyn Fn(&Change) + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Change) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Terminal transfer record kept in the persisted history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSummary {
    pub id: String,
    pub peer: String,
    pub filename: String,
    pub size: u64,
    pub transferred: u64,
    pub direction: String,
    pub status: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    version: u32,
    #[serde(default)]
    connection_info: Option<ConnectionInfo>,
    #[serde(default)]
    last_server: Option<String>,
    #[serde(default)]
    contexts: Vec<context::Snapshot>,
    #[serde(default)]
    transfers: Vec<TransferSummary>,
}

struct Inner {
    values: HashMap<String, Value>,
    validators: HashMap<String, Validator>,
    key_handlers: HashMap<String, Vec<Handler>>,
    global_handlers: Vec<Handler>,
    contexts: context::Map,
    transfers: Vec<TransferSummary>,
}

/// The single owner of all mutable client state. Every `set` runs
/// validator -> snapshot -> assignment under the guard -> subscriber
/// fan-out outside the guard.
pub struct Store {
    inner: Mutex<Inner>,
    path: PathBuf,
    save_interval: Duration,
    persist_secrets: bool,
}

thread_local! {
    static DISPATCHING: std::cell::RefCell<HashSet<String>> =
        std::cell::RefCell::new(HashSet::new());
}

impl Store {
    pub fn new(
        path: impl Into<PathBuf>,
        scrollback: usize,
        save_interval: Duration,
        persist_secrets: bool,
    ) -> Self {
        let path = path.into();
        let mut inner = Inner {
            values: HashMap::new(),
            validators: HashMap::new(),
            key_handlers: HashMap::new(),
            global_handlers: vec![],
            contexts: context::Map::new(scrollback),
            transfers: vec![],
        };

        match load(&path) {
            Ok(Some(persisted)) => {
                if let Some(info) = persisted.connection_info {
                    if let Ok(value) = serde_json::to_value(&info) {
                        inner.values.insert(KEY_CONNECTION_INFO.into(), value);
                    }
                }
                if let Some(last) = persisted.last_server {
                    inner.values.insert(KEY_LAST_SERVER.into(), Value::String(last));
                }
                inner.contexts.restore(persisted.contexts);
                inner.transfers = persisted.transfers;
            }
            Ok(None) => {}
            Err(e) => {
                // Quarantine the unreadable file and start over
                let quarantined =
                    path.with_extension(format!("corrupt.{}", Utc::now().timestamp()));
                log::warn!(
                    "state file {} is corrupt ({e}); quarantining as {}",
                    path.display(),
                    quarantined.display()
                );
                let _ = fs::rename(&path, &quarantined);
            }
        }

        Self {
            inner: Mutex::new(inner),
            path,
            save_interval,
            persist_secrets,
        }
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    pub fn register_validator<F>(&self, key: &str, validator: F)
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.validators.insert(key.to_string(), Arc::new(validator));
    }

    pub fn subscribe<F>(&self, key: &str, handler: F)
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner
            .key_handlers
            .entry(key.to_string())
            .or_default()
            .push(Handler::Sync(Arc::new(handler)));
    }

    pub fn subscribe_async<F>(&self, key: &str, handler: F)
    where
        F: Fn(Change) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner
            .key_handlers
            .entry(key.to_string())
            .or_default()
            .push(Handler::Async(Arc::new(handler)));
    }

    pub fn subscribe_global<F>(&self, handler: F)
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.global_handlers.push(Handler::Sync(Arc::new(handler)));
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    /// Validated assignment. Fails without assigning if the key is
    /// reserved, a handler for the same key is currently running, or
    /// the registered validator rejects the value.
    pub fn set(&self, key: &str, value: Value) -> Result<(), Error> {
        if RESERVED_KEYS.contains(&key) {
            return Err(Error::ReservedKey(key.to_string()));
        }
        self.set_internal(key, value)
    }

    fn set_internal(&self, key: &str, value: Value) -> Result<(), Error> {
        let reentered = DISPATCHING.with(|d| d.borrow().contains(key));
        if reentered {
            log::warn!("rejecting re-entrant set of {key:?} from its own change handler");
            return Err(Error::Reentry(key.to_string()));
        }

        let (change, handlers) = {
            let mut inner = self.lock();

            if let Some(validator) = inner.validators.get(key) {
                validator(&value).map_err(|reason| Error::Validation {
                    field: key.to_string(),
                    reason,
                })?;
            }

            let old = inner.values.insert(key.to_string(), value.clone());

            let change = Change {
                key: key.to_string(),
                old,
                new: Some(value),
                at: Utc::now(),
            };

            let mut handlers = inner
                .key_handlers
                .get(key)
                .cloned()
                .unwrap_or_default();
            handlers.extend(inner.global_handlers.iter().cloned());

            (change, handlers)
        };

        self.dispatch(change, handlers);

        Ok(())
    }

    fn dispatch(&self, change: Change, handlers: Vec<Handler>) {
        DISPATCHING.with(|d| d.borrow_mut().insert(change.key.clone()));

        for handler in &handlers {
            match handler {
                Handler::Sync(f) => f(&change),
                Handler::Async(f) => {
                    let future = f(change.clone());
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(future);
                        }
                        Err(_) => log::warn!(
                            "no runtime available to deliver async change for {:?}",
                            change.key
                        ),
                    }
                }
            }
        }

        DISPATCHING.with(|d| {
            d.borrow_mut().remove(&change.key);
        });
    }

    // Typed accessors for the well-known keys

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.get(KEY_CONNECTION_INFO)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Runs the `ConnectionInfo` validator before committing. On
    /// failure the previous value is kept and the populated
    /// `config_errors` are returned.
    pub fn set_connection_info(&self, mut info: ConnectionInfo) -> Result<(), Error> {
        if !info.validate() {
            return Err(Error::Validation {
                field: KEY_CONNECTION_INFO.to_string(),
                reason: info.config_errors.join("; "),
            });
        }

        let value = serde_json::to_value(&info)?;
        self.set_internal(KEY_CONNECTION_INFO, value)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.get(KEY_CONNECTION_STATE)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Orchestrator-only: `connection_state` is rejected by the public
    /// `set`.
    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        if let Ok(value) = serde_json::to_value(state) {
            let _ = self.set_internal(KEY_CONNECTION_STATE, value);
        }
    }

    pub fn last_server(&self) -> Option<String> {
        self.get(KEY_LAST_SERVER).and_then(|value| match value {
            Value::String(s) => Some(s),
            _ => None,
        })
    }

    pub fn set_last_server(&self, server: &str) {
        let _ = self.set_internal(KEY_LAST_SERVER, Value::String(server.to_string()));
    }

    /// Read access to the contexts under the store guard.
    pub fn contexts<R>(&self, f: impl FnOnce(&context::Map) -> R) -> R {
        f(&self.lock().contexts)
    }

    /// Mutating access to the contexts under the store guard.
    pub fn contexts_mut<R>(&self, f: impl FnOnce(&mut context::Map) -> R) -> R {
        f(&mut self.lock().contexts)
    }

    pub fn push_transfer_summary(&self, summary: TransferSummary) {
        self.lock().transfers.push(summary);
    }

    pub fn transfer_history(&self) -> Vec<TransferSummary> {
        self.lock().transfers.clone()
    }

    /// Writes the serializable subset atomically (write-temp + rename).
    pub fn flush(&self) -> Result<(), Error> {
        let persisted = {
            let inner = self.lock();

            let connection_info = inner
                .values
                .get(KEY_CONNECTION_INFO)
                .cloned()
                .and_then(|value| serde_json::from_value::<ConnectionInfo>(value).ok())
                .map(|info| {
                    if self.persist_secrets {
                        info
                    } else {
                        info.without_secrets()
                    }
                });

            Persisted {
                version: SCHEMA_VERSION,
                connection_info,
                last_server: inner.values.get(KEY_LAST_SERVER).and_then(|v| {
                    v.as_str().map(String::from)
                }),
                contexts: inner.contexts.snapshots(context::DEFAULT_SCROLLBACK),
                transfers: inner.transfers.clone(),
            }
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(&persisted)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load(path: &Path) -> Result<Option<Persisted>, Error> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(path)?;
    let persisted = serde_json::from_slice::<Persisted>(&bytes)?;

    Ok(Some(persisted))
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },
    #[error("key {0:?} is reserved")]
    ReservedKey(String),
    #[error("re-entrant set of {0:?} rejected")]
    Reentry(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("state file corrupted: {0}")]
    Corrupted(#[from] serde_json::Error),
}
