//! Replay recording: one append-only binary file per player per play.
//!
//! Layout is a 14-byte little-endian header (`u16` magic `0x504D`, `u32`
//! chart id, `u32` user id, `u32` record id, initially zero) followed by the
//! raw serialized `Touches`/`Judges` command payloads in arrival order. The
//! record id is patched in place once the play record is validated.

use chrono::Utc;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{self, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

pub const REPLAY_MAGIC: u16 = 0x504d;
pub const REPLAY_EXTENSION: &str = "phirarec";

const RECORD_ID_OFFSET: u64 = 10;
const RETENTION_DAYS: i64 = 4;

pub struct ReplayWriter {
    file: Option<File>,
    path: PathBuf,
}

impl ReplayWriter {
    /// Creates `<base>/<userId>/<chartId>/<timestampMs>.phirarec`, making
    /// directories as needed, and writes the header.
    pub async fn create(record_dir: &Path, user_id: i32, chart_id: i32) -> io::Result<Self> {
        let dir = record_dir
            .join(user_id.to_string())
            .join(chart_id.to_string());
        fs::create_dir_all(&dir).await?;
        let timestamp = Utc::now().timestamp_millis();
        let path = dir.join(format!("{timestamp}.{REPLAY_EXTENSION}"));

        let mut header = [0u8; 14];
        header[0..2].copy_from_slice(&REPLAY_MAGIC.to_le_bytes());
        header[2..6].copy_from_slice(&(chart_id as u32).to_le_bytes());
        header[6..10].copy_from_slice(&(user_id as u32).to_le_bytes());
        // bytes 10..14 stay zero until the record id is known

        let mut file = File::create(&path).await?;
        file.write_all(&header).await?;
        debug!(path = %path.display(), "replay recording started");
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Appends one raw command payload. An I/O failure closes the writer and
    /// never interrupts gameplay.
    pub async fn append(&mut self, payload: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            if let Err(error) = file.write_all(payload).await {
                warn!(path = %self.path.display(), %error, "replay append failed");
                self.file = None;
            }
        }
    }

    /// Patches the record id at its fixed header offset and restores the
    /// append position.
    pub async fn update_record_id(&mut self, record_id: u32) {
        if let Some(file) = self.file.as_mut() {
            let result = async {
                file.seek(SeekFrom::Start(RECORD_ID_OFFSET)).await?;
                file.write_all(&record_id.to_le_bytes()).await?;
                file.seek(SeekFrom::End(0)).await?;
                Ok::<_, io::Error>(())
            }
            .await;
            if let Err(error) = result {
                warn!(path = %self.path.display(), %error, "replay record id update failed");
                self.file = None;
            }
        }
    }

    /// Flushes and closes. Idempotent; later writes are no-ops.
    pub async fn dispose(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(error) = file.flush().await {
                warn!(path = %self.path.display(), %error, "replay flush failed");
            }
            debug!(path = %self.path.display(), "replay recording closed");
        }
    }
}

/// Deletes recordings older than the retention window (timestamp decoded
/// from the file name) and prunes directories left empty. Runs once per day.
pub async fn retention_sweep(record_dir: &Path) -> io::Result<()> {
    let cutoff = Utc::now().timestamp_millis() - RETENTION_DAYS * 24 * 60 * 60 * 1000;
    let mut removed = 0usize;
    let mut user_dirs = match fs::read_dir(record_dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    while let Some(user_dir) = user_dirs.next_entry().await? {
        if !user_dir.file_type().await?.is_dir() {
            continue;
        }
        let mut chart_dirs = fs::read_dir(user_dir.path()).await?;
        while let Some(chart_dir) = chart_dirs.next_entry().await? {
            if !chart_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(chart_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                let timestamp = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<i64>().ok());
                if let Some(timestamp) = timestamp {
                    if timestamp < cutoff {
                        fs::remove_file(&path).await?;
                        removed += 1;
                    }
                }
            }
            // ignores failures on non-empty directories
            let _ = fs::remove_dir(chart_dir.path()).await;
        }
        let _ = fs::remove_dir(user_dir.path()).await;
    }
    if removed > 0 {
        debug!(removed, "replay retention sweep finished");
    }
    Ok(())
}

/// Lists a user's recordings grouped by chart: `(chart_id, timestamp, size)`.
pub async fn list_recordings(record_dir: &Path, user_id: i32) -> Vec<(i32, i64, u64)> {
    let mut recordings = Vec::new();
    let user_dir = record_dir.join(user_id.to_string());
    let Ok(mut chart_dirs) = fs::read_dir(&user_dir).await else {
        return recordings;
    };
    while let Ok(Some(chart_dir)) = chart_dirs.next_entry().await {
        let Some(chart_id) = chart_dir
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(mut files) = fs::read_dir(chart_dir.path()).await else {
            continue;
        };
        while let Ok(Some(file)) = files.next_entry().await {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(REPLAY_EXTENSION) {
                continue;
            }
            let Some(timestamp) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<i64>().ok())
            else {
                continue;
            };
            let size = file.metadata().await.map(|meta| meta.len()).unwrap_or(0);
            recordings.push((chart_id, timestamp, size));
        }
    }
    recordings.sort_unstable();
    recordings
}

/// Path of one recording, if the coordinates are well-formed.
pub fn recording_path(record_dir: &Path, user_id: i32, chart_id: i32, timestamp: i64) -> PathBuf {
    record_dir
        .join(user_id.to_string())
        .join(chart_id.to_string())
        .join(format!("{timestamp}.{REPLAY_EXTENSION}"))
}
