//! Per-session append-only transcript, opened once a session's
//! handshake succeeds (spec §4.3 step 4): `logs/YYYY-MM-DD_<hostname>.log`.
//!
//! Shell's two concurrent copy loops both write to this from different
//! tasks (spec §5), so writes are serialised behind a `tokio::sync::Mutex`.

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct SessionLog {
    file: Mutex<fs::File>,
    path: PathBuf,
}

impl SessionLog {
    pub async fn open(logs_dir: &Path, hostname: &str) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir).await?;
        let today = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{today}_{hostname}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_line(&self, line: &str) {
        self.write_bytes(line.as_bytes()).await;
        self.write_bytes(b"\n").await;
    }

    pub async fn write_bytes(&self, buf: &[u8]) {
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(buf).await {
            tracing::warn!(error = %e, path = %self.path.display(), "session log write failed");
        }
    }
}
