//! Follows an append-only log file and turns each line into a parsed
//! [`Event`] or an archived raw line, pushed into a pair of bounded queues
//! the policy task drains every pass.
//!
//! Structurally this is the same "background task owns a channel" shape as
//! `enforcer::enforce_via_iptables` and `accounter::accounting_worker`, just
//! without a dispatch table since there is exactly one tailer per file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::line_parser::{self, Event};
use crate::policy::TailerQueues;

const EOF_BACKOFF: Duration = Duration::from_millis(100);
const QUEUE_DEPTH: usize = 256;

#[derive(Error, Debug)]
pub enum TailError {
    #[error("log file {0} does not exist or is not a regular file")]
    NotARegularFile(PathBuf),
    #[error("failed to stat log file {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

/// Checked once, synchronously, before spawning the tailer task. A missing
/// log file at startup is fatal per the operational contract.
pub fn ensure_log_file(path: &Path) -> Result<(), TailError> {
    let meta = std::fs::metadata(path).map_err(|e| TailError::Io(path.to_path_buf(), e))?;
    if !meta.is_file() {
        return Err(TailError::NotARegularFile(path.to_path_buf()));
    }
    Ok(())
}

/// Spawns the tailer task for `path` and returns the queues the policy
/// engine drains, labeled for logging.
pub fn spawn(
    label: String,
    path: PathBuf,
    protocols: Option<Arc<HashMap<String, String>>>,
    log: slog::Logger,
) -> (TailerQueues, tokio::task::JoinHandle<()>) {
    let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
    let (invalid_tx, invalid_rx) = mpsc::channel(QUEUE_DEPTH);
    let queues = TailerQueues {
        label: label.clone(),
        events: event_rx,
        invalid: invalid_rx,
    };
    let handle = tokio::task::spawn(tail(label, path, event_tx, invalid_tx, protocols, log));
    (queues, handle)
}

async fn tail(
    label: String,
    path: PathBuf,
    event_tx: mpsc::Sender<Event>,
    invalid_tx: mpsc::Sender<String>,
    protocols: Option<Arc<HashMap<String, String>>>,
    log: slog::Logger,
) {
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(err) => {
            slog::error!(log, "failed to open log file"; "label" => label, "path" => path.display().to_string(), "error" => err.to_string());
            return;
        }
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut reload = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
        Ok(signal) => Some(signal),
        Err(err) => {
            slog::warn!(log, "failed to subscribe to SIGUSR1"; "error" => err.to_string());
            None
        }
    };

    loop {
        let read_result = match reload.as_mut() {
            Some(signal) => {
                tokio::select! {
                    biased;
                    _ = signal.recv() => {
                        slog::info!(log, "received reload signal"; "label" => label.clone());
                        continue;
                    }
                    result = read_one_line(&mut reader, &mut line) => result,
                }
            }
            None => read_one_line(&mut reader, &mut line).await,
        };

        match read_result {
            Ok(true) => {
                let raw = line.trim_end_matches(['\n', '\r']).to_string();
                if !raw.trim().is_empty() {
                    match line_parser::parse_with_protocols(&raw, protocols.as_deref()) {
                        Ok(event) => {
                            let _ = event_tx.send(event).await;
                        }
                        Err(err) => {
                            let _ = invalid_tx.send(err.line).await;
                        }
                    }
                }
            }
            Ok(false) => {
                tokio::time::sleep(EOF_BACKOFF).await;
            }
            Err(err) => {
                slog::error!(log, "error reading log file"; "label" => label.clone(), "error" => err.to_string());
                tokio::time::sleep(EOF_BACKOFF).await;
            }
        }
    }
}

/// Reads one line, returning `Ok(true)` if a line was read, `Ok(false)` on
/// EOF (nothing left to read right now).
async fn read_one_line(
    reader: &mut BufReader<tokio::fs::File>,
    line: &mut String,
) -> std::io::Result<bool> {
    line.clear();
    let n = reader.read_line(line).await?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn ensure_log_file_rejects_missing_path() {
        let err = ensure_log_file(Path::new("/nonexistent/path/to/nothing")).unwrap_err();
        assert!(matches!(err, TailError::Io(_, _)));
    }

    #[test]
    fn ensure_log_file_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_log_file(dir.path()).unwrap_err();
        assert!(matches!(err, TailError::NotARegularFile(_)));
    }

    #[tokio::test]
    async fn tails_lines_and_skips_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kern.log");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Dec 28 22:16:18 hostname kernel: stmt IN=wan OUT= MAC=aa:bb:cc:dd:ee:ff:ff:ee:dd:cc:bb:aa:08:00 SRC=1.2.3.4 DST=4.3.2.1 PROTO=TCP SPT=1 DPT=2").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "garbage missing markers").unwrap();
        drop(file);

        let (mut queues, handle) = spawn(
            "kern".to_string(),
            path,
            None,
            test_log(),
        );

        let event = tokio::time::timeout(Duration::from_secs(2), queues.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        assert_eq!(event.src, "1.2.3.4");

        let invalid = tokio::time::timeout(Duration::from_secs(2), queues.invalid.recv())
            .await
            .expect("timed out waiting for invalid line")
            .expect("channel closed");
        assert_eq!(invalid, "garbage missing markers");

        handle.abort();
    }
}
