use std::sync::Arc;

use anyhow::{Context, Result};
use time::{format_description, UtcOffset};
use tracing_log::LogTracer;
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::Cli;

pub fn init_logging(cli: &Cli, log_to_stderr: bool) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        match cli.debug {
            0 => std::env::set_var("RUST_LOG", "hatchway=info"),
            1 => std::env::set_var("RUST_LOG", "hatchway=debug"),
            2 => std::env::set_var("RUST_LOG", "hatchway=debug,russh=debug"),
            _ => std::env::set_var("RUST_LOG", "debug"),
        }
    }

    LogTracer::init().context("Failed to initialize log compatibility layer")?;

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let env_filter = Arc::new(EnvFilter::from_default_env());
    let enable_colors = !log_to_stderr && console::user_attended();

    let timer = OffsetTime::new(
        offset,
        format_description::parse("[day].[month].[year] [hour]:[minute]:[second]")
            .context("invalid time format")?,
    );

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(enable_colors)
        .with_timer(timer)
        .with_writer(move || -> Box<dyn std::io::Write> {
            if log_to_stderr {
                Box::new(std::io::stderr())
            } else {
                Box::new(std::io::stdout())
            }
        })
        .with_filter(dynamic_filter_fn(move |m, c| {
            env_filter.enabled(m, c.clone())
        }));

    tracing_subscriber::registry().with(fmt_layer).init();
    Ok(())
}
