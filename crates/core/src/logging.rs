//! Logging setup helpers: filter selection, rolling file sink, path
//! redaction and a crash-artifact panic hook.
//!
//! The binary owns the subscriber; this module only computes the plan so it
//! can be unit-tested without a global subscriber.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    env, fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime is chatty at info level.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
/// The file sink keeps runtime warnings (EP fallbacks) the console hides.
pub const FILE_NOISE_FILTER: &str = "ort=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "w2x";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const HOME_PLACEHOLDER: &str = "~";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

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
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

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

    let with_noise = |noise: &str| {
        if implicit && !noise.trim().is_empty() {
            format!("{noise},{user_filter}")
        } else {
            user_filter.clone()
        }
    };
    let console_filter = with_noise(options.noise_filter.as_str());
    let file_filter = with_noise(relax_noise_filter_for_file(&options.noise_filter).as_str());

    LoggingFilterPlan {
        console_filter,
        file_filter,
        user_filter,
    }
}

/// Raise `ort` directives to at least `warn` for the file sink.
fn relax_noise_filter_for_file(noise_filter: &str) -> String {
    noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| match directive.split_once('=') {
            Some((target, level)) if target.trim() == "ort" && level.trim() == "error" => {
                FILE_NOISE_FILTER.to_string()
            }
            _ => directive.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        n => n,
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match appender {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

fn home_dir() -> Option<String> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .ok()
        .filter(|home| home.len() > 1)
}

/// Replace the user's home directory in `input` with `~`, so model and
/// frame paths in shared log files do not leak account names.
pub fn redact_home_dir(input: &str, home: Option<&str>) -> String {
    match home {
        Some(home) if !home.is_empty() => input.replace(home.trim_end_matches(['/', '\\']), HOME_PLACEHOLDER),
        _ => input.to_string(),
    }
}

/// Wraps a `MakeWriter` so every line passes through [`redact_home_dir`].
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    home: Option<String>,
}

pub fn redacting_make_writer<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter {
        inner,
        home: home_dir(),
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<'a, M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer(), self.home.as_deref())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata), self.home.as_deref())
    }
}

/// Buffers partial lines so a path split across writes is still redacted.
#[derive(Debug)]
pub struct RedactingWriter<'h, W: Write> {
    inner: W,
    home: Option<&'h str>,
    pending: Vec<u8>,
}

impl<'h, W: Write> RedactingWriter<'h, W> {
    pub fn new(inner: W, home: Option<&'h str>) -> Self {
        Self {
            inner,
            home,
            pending: Vec::new(),
        }
    }

    fn write_redacted(&mut self, chunk: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(chunk);
        self.inner
            .write_all(redact_home_dir(&text, self.home).as_bytes())
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.write_redacted(&chunk)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.write_redacted(&line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<'_, W> {
    fn drop(&mut self) {
        let _ = self.flush_pending();
        let _ = self.inner.flush();
    }
}

/// Install a panic hook that writes one artifact per panic under
/// `<data_dir>/logs/crash`, then defers to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |panic_info| {
        write_crash_artifact_guarded(&hook_dir, panic_info);
        previous_hook(panic_info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(panic_info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1/full to enable)",
                "<disabled by backtrace policy>".to_string(),
            ),
            _ => ("unsupported", "<backtrace unavailable>".to_string()),
        };

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: panic_info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: panic_payload_to_string(panic_info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;

        let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));

        let mut file = fs::File::create(&path)?;
        writeln!(file, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(file, "version={}", env!("CARGO_PKG_VERSION"))?;
        writeln!(file, "thread={}", self.thread_name)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "payload={}", self.payload)?;
        writeln!(file, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(file, "backtrace:")?;
        writeln!(file, "{}", self.backtrace)?;
        file.flush()?;

        Ok(path)
    }
}

/// Never panics and never recurses: a panic while writing is reported on
/// stderr and swallowed.
fn write_crash_artifact_guarded(crash_dir: &Path, panic_info: &PanicHookInfo<'_>) {
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(panic_info).write_to(crash_dir)
    }));
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("w2x_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "w2x_core=trace");
        assert_eq!(filters.console_filter, "w2x_core=trace");
        assert_eq!(filters.file_filter, "w2x_core=trace");
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 3,
            ..Default::default()
        };

        assert_eq!(compose_logging_filters(&debug).console_filter, "debug");
        assert_eq!(compose_logging_filters(&trace).console_filter, "trace");
    }

    #[test]
    fn rust_log_env_used_when_no_cli_or_verbose() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn,w2x_core::dispatch=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "warn,w2x_core::dispatch=debug");
    }

    #[test]
    fn implicit_filter_gets_noise_filters() {
        let filters = compose_logging_filters(&LoggingInitOptions::default());
        assert_eq!(filters.console_filter, "ort=error,info");
        assert_eq!(filters.file_filter, "ort=warn,info");
    }

    #[test]
    fn custom_noise_directives_survive_file_rewrite() {
        let options = LoggingInitOptions {
            noise_filter: "ort=error,hyper=warn".to_string(),
            ..Default::default()
        };
        let filters = compose_logging_filters(&options);
        assert_eq!(filters.console_filter, "ort=error,hyper=warn,info");
        assert_eq!(filters.file_filter, "ort=warn,hyper=warn,info");
    }

    #[test]
    fn home_dir_is_redacted() {
        let line = "loading /home/alice/models/cunet/scale2.0x_model.onnx";
        assert_eq!(
            redact_home_dir(line, Some("/home/alice/")),
            "loading ~/models/cunet/scale2.0x_model.onnx"
        );
        assert_eq!(redact_home_dir(line, None), line);
    }

    #[test]
    fn redacting_writer_handles_split_writes() {
        let mut inner = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut inner, Some("/home/bob"));
            writer.write_all(b"model=/home/").unwrap();
            writer.write_all(b"bob/m.onnx\n").unwrap();
            writer.write_all(b"tail /home/bob").unwrap();
        }
        let output = String::from_utf8(inner).unwrap();
        assert_eq!(output, "model=~/m.onnx\ntail ~");
    }

    #[test]
    fn file_sink_uses_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready {
                log_dir,
                retention_files,
                ..
            } => {
                assert_eq!(log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert_eq!(retention_files, DEFAULT_LOG_RETENTION_FILES);
                assert!(log_dir.exists());
            }
            FileSinkPlan::Fallback { reason, .. } => {
                panic!("expected ready file sink, got fallback: {reason}")
            }
        }
    }

    #[test]
    fn file_sink_falls_back_without_data_dir_or_when_unwritable() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());

        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let options = LoggingInitOptions {
            data_dir: Some(not_a_dir.path().to_path_buf()),
            ..Default::default()
        };
        let plan = build_file_sink_plan(&options);
        assert_eq!(
            plan.log_dir(),
            Some(not_a_dir.path().join(DEFAULT_LOG_DIR_NAME).as_path())
        );
        assert!(plan
            .fallback_reason()
            .is_some_and(|reason| reason.contains("failed to create log directory")));
    }

    #[test]
    fn crash_report_file_contains_required_sections() {
        let crash_dir = tempdir().expect("tempdir");
        let report = CrashReport {
            timestamp: chrono::Utc::now(),
            thread_name: "frame-worker-3".to_string(),
            location: "src/filter.rs:12:7".to_string(),
            payload: "panic payload".to_string(),
            backtrace_policy: "captured",
            backtrace: "fake backtrace".to_string(),
        };

        let path = report.write_to(crash_dir.path()).expect("write artifact");
        let contents = fs::read_to_string(&path).expect("read artifact");

        assert!(path.starts_with(crash_dir.path()));
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("log"));
        for needle in [
            "timestamp_utc=",
            "version=",
            "thread=frame-worker-3",
            "location=src/filter.rs:12:7",
            "payload=panic payload",
            "backtrace_policy=captured",
            "fake backtrace",
        ] {
            assert!(contents.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn panic_payload_to_string_handles_common_payload_types() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(panic_payload_to_string(str_payload), "boom");
        assert_eq!(panic_payload_to_string(string_payload), "kaboom");
        assert_eq!(
            panic_payload_to_string(int_payload),
            "<non-string panic payload>"
        );
    }
}
