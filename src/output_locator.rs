//! Finds the file a finished run most likely produced.
//!
//! The download utility never reports the final path in a form we rely on,
//! so this picks the newest media file in the destination and refuses it
//! if it is older than the recency window. A different process writing
//! media into the same directory inside the window produces a false
//! positive; that is a known limitation.

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::fs;

use crate::models::LocatedOutput;

/// Extensions considered media output.
pub const MEDIA_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "avi", "mp3", "wav"];

/// Default recency window.
pub const RECENCY_WINDOW: Duration = Duration::from_secs(300);

/// Newest media file in `dir` modified less than `window` ago.
pub async fn locate_recent_output(dir: &Path, window: Duration) -> Result<Option<LocatedOutput>> {
    locate_recent_output_at(dir, window, SystemTime::now()).await
}

/// Same as [`locate_recent_output`] with an explicit "now".
pub async fn locate_recent_output_at(
    dir: &Path,
    window: Duration,
    now: SystemTime,
) -> Result<Option<LocatedOutput>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?;

    let mut newest: Option<(SystemTime, u64, std::path::PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !has_media_extension(&path) {
            continue;
        }

        let meta = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let modified = match meta.modified() {
            Ok(t) => t,
            Err(e) => {
                log::debug!("No modification time for {}: {}", path.display(), e);
                continue;
            }
        };

        let is_newer = newest.as_ref().map_or(true, |(t, _, _)| modified > *t);
        if is_newer {
            newest = Some((modified, meta.len(), path));
        }
    }

    let Some((modified, size_bytes, path)) = newest else {
        return Ok(None);
    };

    // Timestamps in the future count as brand new.
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    if age >= window {
        log::info!(
            "Newest media file {} is {}s old, outside the {}s window",
            path.display(),
            age.as_secs(),
            window.as_secs()
        );
        return Ok(None);
    }

    Ok(Some(LocatedOutput {
        path,
        size_bytes,
        modified: DateTime::<Local>::from(modified),
    }))
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            MEDIA_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}
