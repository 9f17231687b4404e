//! Lazy discovery of input images under a root directory.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use walkdir::WalkDir;

pub const DEFAULT_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Walks `root` and yields image files, one directory at a time, in file-name order.
#[derive(Debug, Clone)]
pub struct ImageSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl ImageSource {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    /// Blocking iterator over matching files. Unreadable entries are logged and skipped.
    pub fn iter(&self) -> impl Iterator<Item = PathBuf> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable path");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(move |p| self.matches(p))
    }

    fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Walk on a blocking thread, handing paths over a channel of `buffer` slots.
    /// The walk stalls while the channel is full and stops when the stream is dropped.
    pub fn into_stream(self, buffer: usize) -> ReceiverStream<PathBuf> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::task::spawn_blocking(move || {
            for path in self.iter() {
                if tx.blocking_send(path).is_err() {
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
