use std::env;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> String {
    format!("tern {VERSION}")
}

pub fn config_dir() -> PathBuf {
    env::var("TERN_CONFIG_DIR")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs_next::config_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tern")
}

pub fn data_dir() -> PathBuf {
    env::var("TERN_DATA_DIR")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs_next::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tern")
}

pub fn download_dir() -> PathBuf {
    dirs_next::download_dir().unwrap_or_else(|| PathBuf::from("downloads"))
}
