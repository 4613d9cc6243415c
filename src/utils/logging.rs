use std::env;
use std::fs;
use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingSettings;

/// Initialize logging: console layer, optional session log file, panic hook.
pub fn init_logging(settings: &LoggingSettings) {
    let enable_backtrace = env::var("RUST_BACKTRACE").unwrap_or_else(|_| "0".to_string()) == "1";

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(&settings.level);
        if let Ok(directive) = "slv_avatar=debug".parse() {
            filter = filter.add_directive(directive);
        }
        filter
    });

    // Session log is recreated on every start
    let log_file = settings.log_file.as_ref().and_then(|path| {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                eprintln!("Warning: Failed to remove existing {}: {}", path.display(), e);
            }
        }
        match fs::File::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Warning: Failed to create {}: {}", path.display(), e);
                None
            }
        }
    });
    let file_logging = log_file.is_some();

    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_writer(file)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(file_layer);

    if subscriber.try_init().is_err() {
        // A subscriber is already installed (tests, embedding host)
        return;
    }

    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("Panic occurred: {}", panic_info);

        if let Some(location) = panic_info.location() {
            tracing::error!(
                "Panic location: {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }

        if enable_backtrace {
            tracing::error!("Backtrace:\n{:?}", std::backtrace::Backtrace::capture());
        }
    }));

    tracing::info!("Logging initialized with level: {}", settings.level);
    tracing::info!("File logging enabled: {}", file_logging);
}
