//! Log line formatting for transports spread over several hosts
//!
//! Every line reads
//! `[host] 2026-01-01T00:00:00.000000Z LEVEL (thread) circuit{id=3}:dispatch target: message`
//! so the output of producer, consumer and dispatch threads on different
//! machines can be merged and still be attributed.

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

use crate::config::LoggingConfig;

/// Event formatter with host and thread prefix
pub struct HostnameFormatter {
    hostname: String,
    thread_names: bool,
}

impl HostnameFormatter {
    pub fn new(thread_names: bool) -> Self {
        Self {
            hostname: hostname(),
            thread_names,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl Default for HostnameFormatter {
    fn default() -> Self {
        Self::new(true)
    }
}

fn hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}

impl<S, N> FormatEvent<S, N> for HostnameFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let now = chrono::Utc::now();

        write!(
            writer,
            "[{}] {} {:5} ",
            self.hostname,
            now.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            meta.level()
        )?;

        if self.thread_names {
            let current = std::thread::current();
            match current.name() {
                Some(name) => write!(writer, "({}) ", name)?,
                None => write!(writer, "({:?}) ", current.id())?,
            }
        }

        // circuit{id=1}:dispatch
        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(writer, ":")?;
                }
                first = false;
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
            if !first {
                write!(writer, " ")?;
            }
        }

        write!(writer, "{}: ", meta.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber from a logging section
///
/// `RUST_LOG` overrides the configured level when set. Only the first call in
/// a process installs anything.
pub fn init(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(HostnameFormatter::new(config.thread_names))
        .with_writer(std::io::stderr);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Logging initialized at level {}", config.level);
    }
}

/// Install the global subscriber at `level` with thread names on
pub fn init_with_hostname(level: &str) {
    init(&LoggingConfig {
        level: level.to_string(),
        ..LoggingConfig::default()
    });
}
