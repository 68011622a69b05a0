//! Logging setup
//!
//! Events go to `<file_path>/<file_name>.log` through a non-blocking writer
//! and are mirrored to stdout. The file is rotated once it passes
//! `max_size_mb`; rotated copies are numbered `.1` (newest) to
//! `.<max_backups>`, and copies older than `max_age_days` are removed at
//! start-up. Both sinks share [`ShortKeyFormat`], which writes the level,
//! time, caller and message under the keys `L`, `T`, `C` and `M`.

use chrono::Local;
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::field::{Field, Visit};
use tracing::{info, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::{Error, Result};

const LOG_SUFFIX: &str = "log";
const BYTES_PER_MB: usize = 1024 * 1024;

/// Event formatter using single-letter keys
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortKeyFormat {
    json: bool,
}

impl ShortKeyFormat {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

/// Local time as `[YYYY/MM/DD HH:MM:SS.fffff]`
fn timestamp() -> String {
    let now = Local::now();
    format!(
        "[{}.{:05}]",
        now.format("%Y/%m/%d %H:%M:%S"),
        now.timestamp_subsec_micros() / 10
    )
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(format!("{:?}", value)));
        }
    }
}

impl<S, N> FormatEvent<S, N> for ShortKeyFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let meta = event.metadata();
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let caller = match (meta.file(), meta.line()) {
            (Some(file), Some(line)) => format!("{}:{}", file, line),
            _ => meta.target().to_string(),
        };
        let level = meta.level().to_string().to_uppercase();

        if self.json {
            let mut record = Map::new();
            record.insert("L".into(), Value::from(level));
            record.insert("T".into(), Value::from(timestamp()));
            record.insert("C".into(), Value::from(caller));
            record.insert("M".into(), Value::from(collector.message));
            record.extend(collector.fields);
            let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
            writeln!(writer, "{}", line)
        } else {
            write!(writer, "{}\t{}\t{}\t{}", timestamp(), level, caller, collector.message)?;
            for (key, value) in &collector.fields {
                write!(writer, "\t{}={}", key, value)?;
            }
            writeln!(writer)
        }
    }
}

/// Log file writer rotating after `max_bytes`, keeping `max_backups` copies
pub fn file_writer(dir: &Path, file_name: &str, max_bytes: usize, max_backups: usize) -> FileRotate<AppendCount> {
    FileRotate::new(
        dir.join(format!("{}.{}", file_name, LOG_SUFFIX)),
        AppendCount::new(max_backups),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    )
}

/// Remove rotated log files older than `max_age`. Returns how many were deleted.
pub fn prune_expired(dir: &Path, file_name: &str, max_age: Duration) -> std::io::Result<usize> {
    let prefix = format!("{}.{}.", file_name, LOG_SUFFIX);
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return Ok(0);
    };

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the lifetime of the process.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(&config.file_path)?;
    let pruned = prune_expired(
        &config.file_path,
        &config.file_name,
        Duration::from_secs(config.max_age_days * 24 * 60 * 60),
    )?;

    let file = file_writer(
        &config.file_path,
        &config.file_name,
        config.max_size_mb * BYTES_PER_MB,
        config.max_backups,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let format = ShortKeyFormat::new(config.json);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(format)
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(format)
                .with_writer(std::io::stdout),
        )
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    info!(
        "File logging enabled to {}/{}.{} (rotate at {} MB, keep {})",
        config.file_path.display(),
        config.file_name,
        LOG_SUFFIX,
        config.max_size_mb,
        config.max_backups
    );
    if pruned > 0 {
        info!("Pruned {} expired log file(s)", pruned);
    }
    Ok(guard)
}

/// In-memory writer for asserting on formatted log output
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CaptureWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl CaptureWriter {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

#[cfg(test)]
impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
