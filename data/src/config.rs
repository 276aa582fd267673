use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::environment;
use crate::store::ConnectionInfo;

/// Capabilities requested from the server when offered.
pub const DEFAULT_CAPS: &[&str] = &[
    "sasl",
    "multi-prefix",
    "server-time",
    "message-tags",
    "account-tag",
    "echo-message",
    "away-notify",
    "chghost",
    "userhost-in-names",
    "cap-notify",
    "extended-join",
    "account-notify",
    "invite-notify",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub dcc: Dcc,
    #[serde(default)]
    pub state: State,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Server {
    pub name: Option<String>,
    pub host: String,
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
}

impl Default for Server {
    fn default() -> Self {
        Self {
            name: None,
            host: String::new(),
            port: 6697,
            use_tls: true,
            verify_tls: true,
            nick: String::new(),
            username: None,
            realname: None,
            server_password: None,
            nickserv_password: None,
            sasl_username: None,
            sasl_password: None,
            channels: vec![],
            caps: DEFAULT_CAPS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Server {
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            server: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls,
            verify_tls: self.verify_tls,
            nick: self.nick.clone(),
            username: self.username.clone(),
            realname: self.realname.clone(),
            server_password: self.server_password.clone(),
            nickserv_password: self.nickserv_password.clone(),
            sasl_username: self.sasl_username.clone(),
            sasl_password: self.sasl_password.clone(),
            channels: self.channels.clone(),
            caps: self.caps.clone(),
            config_errors: vec![],
        }
    }

    /// Stable key used for `last_server` in the persisted state.
    pub fn key(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.host.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Features {
    pub auto_reconnect: bool,
    /// Keep going when CAP negotiation times out.
    pub continue_without_caps: bool,
    pub headless: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            continue_without_caps: true,
            headless: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Dcc {
    pub enabled: bool,
    pub download_dir: PathBuf,
    pub auto_accept: bool,
    pub max_file_size: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub timeout: u64,
    pub resume_enabled: bool,
    pub checksum_verify: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub bandwidth_limit_send_kbps: u64,
    pub bandwidth_limit_recv_kbps: u64,
    pub passive_token_timeout: u64,
    pub advertised_ip: Option<IpAddr>,
    pub cleanup_interval_seconds: u64,
    pub transfer_max_age_seconds: u64,
    pub blocked_extensions: Vec<String>,
}

impl Default for Dcc {
    fn default() -> Self {
        Self {
            enabled: true,
            download_dir: environment::download_dir(),
            auto_accept: false,
            max_file_size: 100 * 1024 * 1024,
            port_range_start: 1024,
            port_range_end: 65535,
            timeout: 300,
            resume_enabled: true,
            checksum_verify: true,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            bandwidth_limit_send_kbps: 0,
            bandwidth_limit_recv_kbps: 0,
            passive_token_timeout: 120,
            advertised_ip: None,
            cleanup_interval_seconds: 3600,
            transfer_max_age_seconds: 3 * 86400,
            blocked_extensions: [".exe", ".bat", ".com", ".scr", ".vbs", ".pif"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl Dcc {
    pub fn send_limit_bytes(&self) -> u64 {
        self.bandwidth_limit_send_kbps * 1024
    }

    pub fn recv_limit_bytes(&self) -> u64 {
        self.bandwidth_limit_recv_kbps * 1024
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct State {
    pub path: PathBuf,
    pub save_interval_seconds: u64,
    pub scrollback: usize,
    pub headless_scrollback: usize,
    pub persist_secrets: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            path: environment::data_dir().join("state.json"),
            save_interval_seconds: 30,
            scrollback: crate::context::DEFAULT_SCROLLBACK,
            headless_scrollback: crate::context::HEADLESS_SCROLLBACK,
            persist_secrets: false,
        }
    }
}

impl State {
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_seconds)
    }
}

impl Config {
    pub fn path() -> PathBuf {
        environment::config_dir().join("config.yaml")
    }

    pub fn load(path: Option<PathBuf>) -> Result<Self, Error> {
        let path = path.unwrap_or_else(Self::path);

        if !path.exists() {
            return Ok(Self::default());
        }

        let file = File::open(&path).map_err(|e| Error::Read(path.clone(), e))?;
        let config = serde_yaml::from_reader(BufReader::new(file))?;

        Ok(config)
    }

    pub fn scrollback(&self) -> usize {
        if self.features.headless {
            self.state.headless_scrollback
        } else {
            self.state.scrollback
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}
