use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use data::client::{Client, Input};
use data::config::Config;
use data::event::Bus;
use data::store::Store;

mod logger;

fn main() {
    // `tern [config-path]`; everything else lives in the config file
    let config_path = env::args().nth(1).map(PathBuf::from);

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tern: {e}");
            std::process::exit(1);
        }
    };

    let headless = config.features.headless;
    if let Err(e) = logger::setup(headless) {
        eprintln!("tern: failed to set up logging: {e}");
        std::process::exit(1);
    }

    log::info!("{} starting", data::environment::version());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("tern: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(run(config));
}

async fn run(config: Config) {
    let store = Arc::new(Store::new(
        config.state.path.clone(),
        config.scrollback(),
        config.state.save_interval(),
        config.state.persist_secrets,
    ));
    let bus = Arc::new(Bus::new());

    let client = Client::new(config.clone(), store.clone(), bus.clone());
    let (inputs, input_receiver) = mpsc::channel(64);

    let mut core = tokio::spawn(client.run(input_receiver));

    if !config.server.host.is_empty() {
        let _ = inputs.send(Input::Connect(None)).await;
    } else {
        log::warn!("no server configured; waiting for /connect");
    }

    // The core owns everything; we only relay shutdown
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received; quitting");
            let _ = inputs
                .send(Input::Quit {
                    reason: Some("interrupted".to_string()),
                })
                .await;
            let _ = core.await;
        }
        result = &mut core => {
            if let Err(e) = result {
                log::error!("core task ended abnormally: {e}");
            }
        }
    }
}
