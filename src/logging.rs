use std::io;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const STDOUT_FILTER: &str = "info,llm_request=info,pipeline=info,clustering=info,db_query=warn,sqlx=off";
const FILE_FILTER: &str = "info,llm_request=debug,pipeline=debug,clustering=debug,sqlx=info";

/// Installs the stdout and daily-rolling file log layers.
///
/// `RUST_LOG` overrides the stdout filter when set.
pub fn configure_logging() {
    let stdout_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(STDOUT_FILTER));

    let stdout_log = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(stdout_filter);

    let file_appender = rolling::daily("logs", "autowire.log");
    let file_log = fmt::layer()
        .with_ansi(false)
        .with_writer(file_appender)
        .with_filter(EnvFilter::new(FILE_FILTER));

    tracing_subscriber::Registry::default()
        .with(stdout_log)
        .with(file_log)
        .init();
}
