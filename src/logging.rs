use colored::Colorize;
use std::fmt;
use std::sync::Once;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Compact event formatter for transport diagnostics.
///
/// Renders `LEVEL target: fields` on one line, coloring only the level tag
/// so transport names, event ids, and error text stay copy-paste clean.
/// The target is kept because a manager, its transports, and the pool all
/// log through this crate and the module path is what tells them apart.
pub struct TransportLogFormatter;

impl TransportLogFormatter {
    fn level_tag(level: Level) -> colored::ColoredString {
        match level {
            Level::ERROR => "ERROR".red().bold(),
            Level::WARN => " WARN".yellow(),
            Level::INFO => " INFO".green(),
            Level::DEBUG => "DEBUG".cyan(),
            Level::TRACE => "TRACE".dimmed(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for TransportLogFormatter
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
        let metadata = event.metadata();
        write!(
            writer,
            "{} {}: ",
            Self::level_tag(*metadata.level()),
            metadata.target().dimmed()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

static INIT: Once = Once::new();

/// Install a subscriber honoring `RUST_LOG`, formatted for this crate.
///
/// Safe to call repeatedly; only the first call installs anything. Library
/// consumers that configure their own subscriber should simply not call
/// this.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("event_transport=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .event_format(TransportLogFormatter)
            .try_init();
    });
}
