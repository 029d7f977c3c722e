//! Per-account append-only log files
//!
//! Events recorded inside an account's span (see `supervisor.rs`), or
//! carrying an `account` field, are appended to
//! `<dir>/titan_<label>.log` as one plain-text line each. The JSON stream
//! on stdout is unaffected.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context as _, Result};
use chrono::{SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// Stored in the extensions of a span that carries an `account` field.
struct AccountLabel(String);

pub struct AccountLogLayer {
    writers: HashMap<String, NonBlocking>,
}

impl AccountLogLayer {
    /// Open one appender per label under `dir`, creating it if needed.
    ///
    /// The returned guards flush pending lines when dropped; hold them
    /// until shutdown.
    pub fn open(dir: &Path, labels: &[String]) -> Result<(Self, Vec<WorkerGuard>)> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;

        let mut writers = HashMap::with_capacity(labels.len());
        let mut guards = Vec::with_capacity(labels.len());
        for label in labels {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_stem(label))
                .filename_suffix("log")
                .build(dir)
                .with_context(|| format!("failed to open log file for account {label}"))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            writers.insert(label.clone(), writer);
            guards.push(guard);
        }
        Ok((Self { writers }, guards))
    }
}

/// `titan_<label>` with anything outside `[A-Za-z0-9_-]` replaced.
fn file_stem(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("titan_{safe}")
}

impl<S> Layer<S> for AccountLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut fields = LineFields::default();
        attrs.record(&mut fields);
        if let (Some(label), Some(span)) = (fields.account, ctx.span(id)) {
            span.extensions_mut().insert(AccountLabel(label));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut fields = LineFields::default();
        event.record(&mut fields);

        let label = ctx
            .event_scope(event)
            .and_then(|scope| {
                scope.from_root().find_map(|span| {
                    span.extensions()
                        .get::<AccountLabel>()
                        .map(|label| label.0.clone())
                })
            })
            .or(fields.account);
        let Some(writer) = label.and_then(|label| self.writers.get(&label)) else {
            return;
        };

        let line = format!(
            "{} {} {}{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event.metadata().level(),
            fields.message,
            fields.rest
        );
        let mut writer = writer.clone();
        let _ = writer.write_all(line.as_bytes());
    }
}

/// Splits an event's fields into the message, the account label and the rest.
#[derive(Default)]
struct LineFields {
    message: String,
    account: Option<String>,
    rest: String,
}

impl Visit for LineFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "account" => self.account = Some(value.to_string()),
            name => {
                let _ = write!(self.rest, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "account" => self.account = Some(format!("{value:?}")),
            name => {
                let _ = write!(self.rest, " {name}={value:?}");
            }
        }
    }
}
