#![allow(clippy::large_enum_variant, clippy::too_many_arguments)]

pub use self::config::Config;
pub use self::context::Context;
pub use self::event::Bus;
pub use self::server::Server;
pub use self::store::Store;
pub use self::user::{Nick, User};

pub mod client;
pub mod config;
pub mod context;
pub mod ctcp;
pub mod dcc;
pub mod environment;
pub mod event;
pub mod file_transfer;
pub mod isupport;
pub mod log;
pub mod mode;
pub mod scripts;
pub mod server;
pub mod store;
pub mod trigger;
pub mod user;
