use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_FILE_NAME: &str = "glass-relay.log";

type SharedFile = Arc<Mutex<File>>;

/// Tees every log line to stdout and, when configured, the relay log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<SharedFile>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
        Ok(())
    }
}

/// `debug` wins over `GLASS_LOG_LEVEL`; `RUST_LOG` wins over both. Returns
/// the log file path when one is being written.
pub fn init_logging(debug: bool, log_dir: &str) -> Option<PathBuf> {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("GLASS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let path = log_path(log_dir);
    let file = path.as_deref().and_then(|path| match open_append(path) {
        Ok(file) => Some(Arc::new(Mutex::new(file))),
        Err(err) => {
            eprintln!("log_file_error: {}: {err}", path.display());
            None
        }
    });
    let path = path.filter(|_| file.is_some());
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stdout: io::stdout(),
        file: file.clone(),
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .try_init();
    path
}

/// A blank directory means stdout only.
fn log_path(log_dir: &str) -> Option<PathBuf> {
    let log_dir = log_dir.trim();
    (!log_dir.is_empty()).then(|| Path::new(log_dir).join(LOG_FILE_NAME))
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_log_dir_means_stdout_only() {
        assert_eq!(log_path("  "), None);
        assert_eq!(
            log_path(".simglass/logs"),
            Some(PathBuf::from(".simglass/logs/glass-relay.log"))
        );
    }

    #[test]
    fn open_append_creates_missing_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(LOG_FILE_NAME);
        let mut file = open_append(&path).expect("open");
        file.write_all(b"relay_start\n").expect("write");
        let mut again = open_append(&path).expect("reopen");
        again.write_all(b"relay_stop\n").expect("write");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "relay_start\nrelay_stop\n"
        );
    }

    #[test]
    fn env_true_accepts_common_spellings() {
        std::env::set_var("GLASS_TEST_FLAG_ON", "Yes");
        std::env::set_var("GLASS_TEST_FLAG_OFF", "0");
        assert!(env_true("GLASS_TEST_FLAG_ON"));
        assert!(!env_true("GLASS_TEST_FLAG_OFF"));
        assert!(!env_true("GLASS_TEST_FLAG_MISSING"));
    }
}
