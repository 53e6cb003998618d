use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

pub const LOG_FILE_NAME: &str = "johnnybot.log";

/// Initialize tracing: human-readable lines on stderr plus a plain copy in
/// `<log_dir>/johnnybot.log`.
///
/// stdout is reserved for the host protocol, so nothing here may write to it.
/// Keep the returned guard alive for the life of the process or buffered
/// file lines are lost on exit.
pub fn init(service_name: &str, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,jb=info,jb_core=info,jb_ical=info,{}=info",
            service_name.replace('-', "_")
        ))
    });

    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(true),
        )
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {e}")))?;

    Ok(guard)
}

/// Last `n` lines of the log file, oldest first.
///
/// Blocking; call from a worker.
pub fn log_tail(path: &Path, n: usize) -> Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut tail = VecDeque::with_capacity(n.min(4096));
    for line in BufReader::new(file).lines() {
        let line = line?;
        if tail.len() == n {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Ok(tail.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_tail_returns_last_lines_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(LOG_FILE_NAME);
        let mut f = File::create(&path).unwrap();
        for i in 1..=10 {
            writeln!(f, "line {i}").unwrap();
        }

        let tail = log_tail(&path, 3).unwrap();
        assert_eq!(tail, vec!["line 8", "line 9", "line 10"]);

        let all = log_tail(&path, 50).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], "line 1");
    }

    #[test]
    fn log_tail_of_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let tail = log_tail(&tmp.path().join("nope.log"), 5).unwrap();
        assert!(tail.is_empty());
    }
}
