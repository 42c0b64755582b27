use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

const FILE_PREFIX: &str = "skb-desk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Hourly,
    Daily,
}

impl Rotation {
    /// Unknown values fall back to daily.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            _ => Rotation::Daily,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logging filtered by `RUST_LOG` (default `info`). With a log
/// directory (argument, else `SKB_LOG_DIR`) the `skb::*` targets are also
/// written to a rolling file; `SKB_LOG_ROTATION` picks `daily` or `hourly`.
pub fn init(log_dir: Option<&str>) {
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(env_filter()));
    let dir = log_dir
        .map(str::to_string)
        .or_else(|| std::env::var("SKB_LOG_DIR").ok())
        .filter(|d| !d.trim().is_empty());
    let Some(dir) = dir else {
        let _ = registry.try_init();
        return;
    };

    let rotation = Rotation::parse(
        &std::env::var("SKB_LOG_ROTATION").unwrap_or_else(|_| "daily".into()),
    );
    let dir_ok = std::fs::create_dir_all(&dir).is_ok();
    let writer = match rotation {
        Rotation::Hourly => tracing_appender::rolling::hourly(&dir, FILE_PREFIX),
        Rotation::Daily => tracing_appender::rolling::daily(&dir, FILE_PREFIX),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let targets = Targets::new().with_target("skb", tracing::Level::INFO);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(file_layer).try_init();
    if !dir_ok {
        tracing::warn!(directory = %dir, "failed to create log directory");
    }
}
