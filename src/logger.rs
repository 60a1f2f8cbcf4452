use std::path::Path;

use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

pub const LOG_FILE: &str = "experiment.log";

/// If a global tracing subscriber is not already configured, log to stderr and
/// to `experiment.log` inside the model directory, and add a panic hook
/// pointing at that file. Returns whether the subscriber was installed.
pub fn install_logger(model_dir: &Path) -> bool {
    if let Err(err) = std::fs::create_dir_all(model_dir) {
        eprintln!("Unable to create {}: {err}", model_dir.display());
    }

    let file_path = model_dir.join(LOG_FILE);
    let writer = tracing_appender::rolling::never(model_dir, LOG_FILE);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(is_relevant));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(is_relevant));

    let installed = registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        update_panic_hook(&file_path);
    }
    installed
}

fn is_relevant(metadata: &tracing_core::Metadata<'_>) -> bool {
    if let Some(path) = metadata.module_path() {
        // The wgpu crate is logging too much, so we skip `info` level.
        if path.starts_with("wgpu") && *metadata.level() >= Level::INFO {
            return false;
        }
    }
    true
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        eprintln!(
            "=== PANIC ===\nA fatal error happened, you can check the experiment logs here => \
             '{file_path}'\n============="
        );
        hook(info);
    }));
}
