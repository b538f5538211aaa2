use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Flushes the non-blocking console writer on exit; must outlive the subscriber.
static CONSOLE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

/// `None` means the sink is switched off for that target.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" | "" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// `target` belongs to `prefix` if it is the prefix itself or one of its
/// `::` children.
fn matches_target_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating file writers =================

#[derive(Clone)]
struct RotatingFile(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl RotatingFile {
    fn open(path: &Path, section: &Section) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;
        let limit = match section.max_backups {
            Some(n) => FileLimit::MaxFiles(n),
            None => FileLimit::Age(chrono::Duration::days(7)),
        };
        let rotate = FileRotate::new(
            path,
            AppendTimestamp::default(limit),
            ContentLimit::BytesSurpassed(max_bytes),
            Compression::None,
            None,
        );
        Ok(Self(Arc::new(Mutex::new(rotate))))
    }
}

/// Writer for one record; `None` drops it.
struct FileHandle(Option<RotatingFile>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file.0.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file.0.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Sends each record to the file of the longest matching target prefix,
/// falling back to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<RotatingFile>,
    by_prefix: Vec<(String, RotatingFile)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = FileRouter::default();
        for (name, section) in cfg {
            if section.file.trim().is_empty() {
                continue;
            }
            let path = resolve_log_path(&section.file, base_dir);
            let file = match RotatingFile::open(&path, section) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("Failed to open log file '{}' for '{name}': {e}", path.display());
                    continue;
                }
            };
            if name == DEFAULT_SECTION {
                router.default = Some(file);
            } else {
                router.by_prefix.push((name.clone(), file));
            }
        }
        // longest prefix wins
        router.by_prefix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        router
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }

    fn resolve(&self, target: &str) -> Option<RotatingFile> {
        self.by_prefix
            .iter()
            .find(|(prefix, _)| matches_target_prefix(target, prefix))
            .map(|(_, file)| file.clone())
            .or_else(|| self.default.clone())
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        FileHandle(self.resolve(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

// ================= per-sink level targets =================

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File,
}

impl Sink {
    fn level(self, section: &Section) -> Option<LevelFilter> {
        match self {
            Sink::Console => parse_level(&section.console_level),
            Sink::File if section.file.trim().is_empty() && section.file_level.is_empty() => None,
            Sink::File => parse_level(&section.file_level),
        }
    }
}

fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let default = cfg
        .get(DEFAULT_SECTION)
        .map(|s| sink.level(s).unwrap_or(LevelFilter::OFF))
        .unwrap_or(match sink {
            Sink::Console => LevelFilter::INFO,
            Sink::File => LevelFilter::OFF,
        });

    cfg.iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .fold(Targets::new().with_default(default), |targets, (name, section)| {
            let level = sink.level(section).unwrap_or(LevelFilter::OFF);
            targets.with_target(name.clone(), level)
        })
}

// ================= public init =================

/// Install the global subscriber: console on stderr plus, when any section
/// names a file, JSON records written to size-rotated files.
///
/// `RUST_LOG`, when set, caps both sinks. Relative file paths are resolved
/// against `base_dir`. Safe to call more than once; later calls are ignored.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(build_targets(cfg, Sink::Console));

    let router = FileRouter::build(cfg, base_dir);
    let file = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(build_targets(cfg, Sink::File))
    });

    let _ = tracing_subscriber::registry()
        .with(env)
        .with(console)
        .with(file)
        .try_init();
}
