use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{DurableStore, StoreError};

/// File extension for stored records. Values are JSON by convention.
const RECORD_EXTENSION: &str = "json";

/// Suffix of in-progress writes; never matches a record name.
const TEMP_EXTENSION: &str = "tmp";

/// One directory per namespace, one file per key.
///
/// Keys are percent-encoded into file names so that arbitrary cache keys
/// (`08NA011:BC`, `a/b`) map onto portable paths. Writes go through a
/// temporary file and a rename so a crash never leaves a torn record.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Distinguishes temp files of concurrent writers.
    write_seq: AtomicU64,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(encode_component(namespace))
    }

    fn record_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.{}", encode_component(key), RECORD_EXTENSION))
    }

    fn temp_path(&self, namespace: &str, key: &str) -> PathBuf {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        self.namespace_dir(namespace).join(format!(
            ".{}.{}-{}.{}",
            encode_component(key),
            std::process::id(),
            seq,
            TEMP_EXTENSION
        ))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.record_path(namespace, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.record_path(namespace, key);
        let tmp = self.temp_path(namespace, key);
        if let Err(e) = tokio::fs::write(&tmp, value).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %path.display(), "Wrote durable record");
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.record_path(namespace, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(&format!(".{}", RECORD_EXTENSION)) else {
                continue;
            };
            if let Some(key) = decode_component(stem) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Percent-encode a key or namespace into one path component. `.` and `..`
/// are escaped too so a namespace never names the root or its parent.
fn encode_component(s: &str) -> String {
    match s {
        "." | ".." => s.replace('.', "%2E"),
        _ => urlencoding::encode(s).into_owned(),
    }
}

/// `None` for names that do not decode to UTF-8 (foreign files).
fn decode_component(s: &str) -> Option<String> {
    urlencoding::decode(s).ok().map(|decoded| decoded.into_owned())
}
