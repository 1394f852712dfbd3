//! Structured logging utilities for multi-component traceability
//!
//! Server, client and parser runs share one log format: every line starts
//! with `[component:pid]` so interleaved logs from several processes can be
//! told apart.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::constants;

/// Which process is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Server,
    Client,
    Parser,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Server => "server",
            Component::Client => "client",
            Component::Parser => "parser",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefixes each event with the component and pid, then defers to `inner`.
struct ComponentFormat<E> {
    component: Component,
    pid: u32,
    inner: E,
}

impl<S, N, E> FormatEvent<S, N> for ComponentFormat<E>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "[{}:{}] ", self.component, self.pid)?;
        self.inner.format_event(ctx, writer, event)
    }
}

/// Initialize tracing with component-prefixed lines.
///
/// Without `enable_dev_log`, logs go to stderr filtered by `RUST_LOG`. With
/// it, everything at DEBUG and above is appended to the dev log file; keep
/// the returned guard alive until exit so buffered lines are flushed.
pub fn init_component_tracing(
    component: Component,
    enable_dev_log: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let pid = std::process::id();
    let prefixed = move |inner| ComponentFormat {
        component,
        pid,
        inner,
    };

    if enable_dev_log {
        use std::fs::OpenOptions;
        use tracing_appender::non_blocking;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(constants::dev_log_path())?;
        let (file_writer, guard) = non_blocking(file);

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .map_event_format(prefixed)
                    .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
            )
            .try_init()?;

        eprintln!(
            "Development logging enabled - writing to {} (PID: {})",
            constants::dev_log_path(),
            pid
        );

        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .map_event_format(prefixed)
                    .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
            )
            .try_init()?;

        Ok(None)
    }
}
