//! File tailers.
//!
//! Children write to on-disk log files, not pipes, so their output
//! survives a daemon crash. A tailer task streams appended lines from one
//! of those files into the server's [`LogStore`]. Tailer lifetime is
//! decoupled from child lifetime: a restarted daemon re-attaches a tailer
//! to the same file and picks up where the file is.

use crate::defaults::TAIL_POLL_INTERVAL;
use crate::logs::LogStore;
use canopy_core::LogSource;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::task::JoinHandle;

/// Where a tailer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFrom {
    /// Read the whole file from the beginning (fresh start).
    Start,
    /// Seek to the end first (re-attach after the backlog was already
    /// replayed into the buffers).
    End,
}

/// Replay the last `max_lines` complete lines of `path` into `store`.
/// Used during orphan re-attach to rebuild the in-memory buffers.
pub async fn replay_tail(
    path: &PathBuf,
    source: LogSource,
    store: &LogStore,
    max_lines: usize,
) -> std::io::Result<()> {
    let contents = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = contents.lines().collect();
    let skip = lines.len().saturating_sub(max_lines);
    for line in &lines[skip..] {
        store.push(source, (*line).to_string());
    }
    Ok(())
}

/// Spawn a task that follows `path`, pushing each complete line into
/// `store`. The task never exits on its own (the file may always grow
/// again); the owner aborts it when the record is stopped or pruned.
pub fn spawn_tailer(
    path: PathBuf,
    source: LogSource,
    store: Arc<LogStore>,
    from: TailFrom,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tail_file(&path, source, &store, from).await {
            tracing::warn!(path = %path.display(), error = %e, "log tailer stopped");
        }
    })
}

async fn tail_file(
    path: &PathBuf,
    source: LogSource,
    store: &LogStore,
    from: TailFrom,
) -> std::io::Result<()> {
    let mut file = open_with_retry(path).await?;
    if from == TailFrom::End {
        file.seek(SeekFrom::End(0)).await?;
    }

    let mut reader = BufReader::new(file);
    let mut buf = String::new();

    loop {
        let n = reader.read_line(&mut buf).await?;
        if n == 0 {
            // At EOF. The child may still be writing; poll for growth.
            tokio::time::sleep(TAIL_POLL_INTERVAL).await;
            continue;
        }
        if !buf.ends_with('\n') {
            // Partial line: the writer is mid-write. Keep accumulating.
            continue;
        }
        let line = buf.trim_end_matches(['\n', '\r']).to_string();
        store.push(source, line);
        buf.clear();
    }
}

async fn open_with_retry(path: &PathBuf) -> std::io::Result<tokio::fs::File> {
    // The spawner creates the file before the child runs, but re-attach can
    // race file creation on a slow disk. A few retries cover it.
    let mut last_err = None;
    for _ in 0..20 {
        match tokio::fs::File::open(path).await {
            Ok(file) => return Ok(file),
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(TAIL_POLL_INTERVAL).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "log file never appeared")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn wait_for_lines(store: &LogStore, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.len() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {n} lines (have {})",
                store.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn tailer_streams_appended_lines() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out.log");
        let mut file = tokio::fs::File::create(&path).await.unwrap();

        let store = Arc::new(LogStore::with_capacity(64));
        let handle = spawn_tailer(
            path.clone(),
            LogSource::Stdout,
            store.clone(),
            TailFrom::Start,
        );

        file.write_all(b"first line\nsecond line\n").await.unwrap();
        file.flush().await.unwrap();

        wait_for_lines(&store, 2).await;
        let tail = store.tail(10);
        assert_eq!(tail[0].line, "first line");
        assert_eq!(tail[1].line, "second line");

        handle.abort();
    }

    #[tokio::test]
    async fn tailer_holds_partial_lines_until_newline() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out.log");
        let mut file = tokio::fs::File::create(&path).await.unwrap();

        let store = Arc::new(LogStore::with_capacity(64));
        let handle = spawn_tailer(
            path.clone(),
            LogSource::Stdout,
            store.clone(),
            TailFrom::Start,
        );

        file.write_all(b"hal").await.unwrap();
        file.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.len(), 0, "partial line must not be emitted");

        file.write_all(b"f line\n").await.unwrap();
        file.flush().await.unwrap();
        wait_for_lines(&store, 1).await;
        assert_eq!(store.tail(1)[0].line, "half line");

        handle.abort();
    }

    #[tokio::test]
    async fn tail_from_end_skips_existing_content() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out.log");
        tokio::fs::write(&path, b"old line\n").await.unwrap();

        let store = Arc::new(LogStore::with_capacity(64));
        let handle = spawn_tailer(
            path.clone(),
            LogSource::Stderr,
            store.clone(),
            TailFrom::End,
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.len(), 0);

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"new line\n").await.unwrap();
        file.flush().await.unwrap();

        wait_for_lines(&store, 1).await;
        assert_eq!(store.tail(1)[0].line, "new line");

        handle.abort();
    }

    #[tokio::test]
    async fn replay_tail_rebuilds_only_the_last_lines() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out.log");
        let contents = (0..10).map(|i| format!("line {i}\n")).collect::<String>();
        tokio::fs::write(&path, contents).await.unwrap();

        let store = LogStore::with_capacity(64);
        replay_tail(&path, LogSource::Stdout, &store, 3)
            .await
            .unwrap();

        let tail = store.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].line, "line 7");
        assert_eq!(tail[2].line, "line 9");
    }
}
