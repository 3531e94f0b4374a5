use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Set to `debug` or `trace` for chattier device logs.
pub const LOG_LEVEL_ENV: &str = "PCM_IODEV_LOG";

fn level_from_env() -> Level {
    match std::env::var(LOG_LEVEL_ENV)
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Ok("trace") => Level::TRACE,
        Ok("debug") => Level::DEBUG,
        Ok("warn") => Level::WARN,
        Ok("error") => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs a fmt subscriber as the global default. Returns false if one
/// was already installed.
pub fn init_logging() -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_from_env())
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
