use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::OpenOptions;
use std::path::Path;

/// Log level from `LOG_LEVEL`, defaulting to info.
fn level_from_env() -> LevelFilter {
    std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Log to the terminal and append to `log_file`.
pub fn init_logging(log_file: &str) -> Result<()> {
    if let Some(parent) = Path::new(log_file).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file))?;

    let level = level_from_env();
    let config = ConfigBuilder::new()
        .add_filter_ignore_str("sqlx")
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(level, config, file),
    ])
    .with_context(|| "Failed to initialize logger")?;

    log::info!("Logging initialized at level {}", level);
    Ok(())
}
