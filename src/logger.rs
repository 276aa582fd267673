use std::env;

pub fn setup(to_stdout: bool) -> Result<(), Error> {
    let level_filter = env::var("RUST_LOG")
        .ok()
        .as_deref()
        .map(str::parse::<log::LevelFilter>)
        .transpose()
        .map_err(|_| Error::InvalidLevel)?
        .unwrap_or(log::LevelFilter::Info);

    let mut logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Off)
        .level_for("data", level_filter)
        .level_for("irc", level_filter)
        .level_for("proto", level_filter)
        .level_for("tern", level_filter);

    if to_stdout {
        logger = logger.chain(std::io::stdout());
    } else {
        logger = logger.chain(data::log::file()?);
    }

    logger.apply()?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid RUST_LOG level filter")]
    InvalidLevel,
    #[error(transparent)]
    File(#[from] data::log::Error),
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}
