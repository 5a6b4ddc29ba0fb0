//! Log filter composition, the rolling file sink, and secret redaction for
//! everything that reaches a log line (model URLs often carry tokens).

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tessera";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

/// Per-tile timings are too chatty for the console but useful in the file.
const FILE_DEBUG_TARGETS: [&str; 2] = ["tessera_core::pipeline", "tessera_core::engine"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        retention_files: usize,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn retention_files(&self) -> usize {
        match self {
            Self::Ready {
                retention_files, ..
            }
            | Self::Fallback {
                retention_files, ..
            } => *retention_files,
        }
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason.as_str()),
        }
    }

    /// Hands out the appender when the sink is usable.
    pub fn into_appender(self) -> Option<RollingFileAppender> {
        match self {
            Self::Ready { appender, .. } => Some(appender),
            Self::Fallback { .. } => None,
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Daily-rotated `tessera.*.log` files under `<data_dir>/logs`.
///
/// Never fails: problems become a `Fallback` plan and logging continues on
/// the console only.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Filter precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`,
/// then the default. The noise filter is only prepended when the user did
/// not pick a filter explicitly.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    let implicit = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;
    if !implicit {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    let console_filter = prepend_directives(&options.noise_filter, &user_filter);
    let file_filter =
        prepend_directives(&with_file_debug_targets(&options.noise_filter), &user_filter);
    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn prepend_directives(prefix: &str, filter: &str) -> String {
    if prefix.trim().is_empty() {
        filter.to_string()
    } else {
        format!("{prefix},{filter}")
    }
}

/// Appends `target=debug` for each file debug target the noise filter does
/// not already mention.
fn with_file_debug_targets(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(str::to_string)
        .collect();

    for target in FILE_DEBUG_TARGETS {
        let mentioned = directives
            .iter()
            .any(|d| d.split_once('=').map_or(d.as_str(), |(t, _)| t).trim() == target);
        if !mentioned {
            directives.push(format!("{target}=debug"));
        }
    }

    directives.join(",")
}

/// Wraps a [`MakeWriter`] so every line is passed through
/// [`redact_sensitive_text`] before it is written.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers partial lines so a secret split across writes is still caught.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.pending.drain(..upto).collect();
        let redacted = redact_sensitive_text(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(redacted.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            self.emit(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.emit(self.pending.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Masks URL userinfo and the values of secret-looking `key=value` or
/// `key: value` pairs.
pub fn redact_sensitive_text(input: &str) -> String {
    redact_assignments(&redact_url_userinfo(input))
}

fn redact_url_userinfo(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(found) = input[cursor..].find("://") {
        let authority_start = cursor + found + 3;
        let authority_end = input[authority_start..]
            .find(|ch: char| {
                ch.is_whitespace() || matches!(ch, '/' | '?' | '#' | '"' | '\'' | '<' | '>')
            })
            .map_or(input.len(), |offset| authority_start + offset);

        output.push_str(&input[cursor..authority_start]);
        match input[authority_start..authority_end].rfind('@') {
            Some(at) if at > 0 => {
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&input[authority_start + at..authority_end]);
            }
            _ => output.push_str(&input[authority_start..authority_end]),
        }
        cursor = authority_end;
    }

    output.push_str(&input[cursor..]);
    output
}

fn redact_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;
    let mut index = 0;

    while index < bytes.len() {
        if !matches!(bytes[index], b'=' | b':') {
            index += 1;
            continue;
        }

        let key_start = bytes[..index]
            .iter()
            .rposition(|b| !(b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-'))
            .map_or(0, |p| p + 1);
        let key = input[key_start..index].to_ascii_lowercase();
        if key.is_empty() || !is_sensitive_key(&key) {
            index += 1;
            continue;
        }

        match secret_value_range(input, index + 1) {
            Some((start, end)) => {
                output.push_str(&input[cursor..start]);
                output.push_str(REDACTION_PLACEHOLDER);
                cursor = end;
                index = end;
            }
            None => index += 1,
        }
    }

    output.push_str(&input[cursor..]);
    output
}

/// Byte range of the value that follows a separator, skipping leading
/// whitespace, a `Bearer ` scheme, and surrounding quotes.
fn secret_value_range(input: &str, after_separator: usize) -> Option<(usize, usize)> {
    let bytes = input.as_bytes();
    let mut start = after_separator;
    while start < bytes.len() && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    if input
        .get(start..start + 7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "))
    {
        start += 7;
    }
    if start >= bytes.len() {
        return None;
    }

    let (start, end) = if matches!(bytes[start], b'"' | b'\'') {
        let quote = bytes[start] as char;
        let content = start + 1;
        let end = input[content..]
            .find(quote)
            .map_or(input.len(), |offset| content + offset);
        (content, end)
    } else {
        let end = bytes[start..]
            .iter()
            .position(|b| {
                b.is_ascii_whitespace()
                    || matches!(b, b'&' | b',' | b';' | b')' | b']' | b'}' | b'"' | b'\'')
            })
            .map_or(input.len(), |offset| start + offset);
        (start, end)
    };

    (end > start).then_some((start, end))
}

fn is_sensitive_key(key: &str) -> bool {
    matches!(key, "key" | "pwd" | "passwd" | "authorization" | "sig" | "signature")
        || key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("apikey")
}
