use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{PutRequest, RemoteObject, RemoteStore, StoreError};

const BUFFER_SIZE: usize = 128 * 1024;
const META_DIR: &str = ".meta";

/// A bucket kept in a local directory.
///
/// Object bodies live at `root/bucket/<key>`; per-object metadata (checksum,
/// ETag, headers) sits beside them under `root/bucket/.meta/<key>.json`.
pub struct FsStore {
    bucket_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    etag: String,
    sha256: String,
    size: u64,
    content_type: String,
    cache_control: String,
    stored_at: DateTime<Utc>,
}

impl FsStore {
    pub fn new(root: impl AsRef<Path>, bucket: &str) -> Self {
        Self {
            bucket_dir: root.as_ref().join(bucket),
        }
    }

    fn relative_key(key: &str) -> Result<PathBuf, StoreError> {
        let rel = PathBuf::from(key);
        let valid = !key.is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_)))
            && rel
                .components()
                .next()
                .is_some_and(|c| c.as_os_str() != META_DIR);
        if valid {
            Ok(rel)
        } else {
            Err(StoreError::Permanent(format!("invalid object key `{key}`")))
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self.bucket_dir.join(Self::relative_key(key)?))
    }

    fn meta_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let path = self.bucket_dir.join(META_DIR).join(Self::relative_key(key)?);
        Ok(with_suffix(&path, ".json"))
    }
}

#[async_trait]
impl RemoteStore for FsStore {
    async fn check_access(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.bucket_dir)
            .await
            .map_err(|e| {
                StoreError::Fatal(format!(
                    "cannot use bucket directory {}: {e}",
                    self.bucket_dir.display()
                ))
            })
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObject>, StoreError> {
        let meta_path = self.meta_path(key)?;
        let bytes = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };

        let meta: ObjectMeta = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Permanent(format!("corrupt metadata for `{key}`: {e}"))
        })?;

        Ok(Some(RemoteObject {
            etag: meta.etag,
            checksum: Some(meta.sha256),
            size: Some(meta.size),
        }))
    }

    async fn put(&self, req: &PutRequest) -> Result<String, StoreError> {
        let object_path = self.object_path(&req.key)?;
        let meta_path = self.meta_path(&req.key)?;
        let req = req.clone();

        tokio::task::spawn_blocking(move || store_object(&req, &object_path, &meta_path))
            .await
            .map_err(|e| StoreError::Transient(format!("store task failed: {e}")))?
    }
}

/// Copy the body into place through a temp file, hashing as it goes, then
/// write the metadata sidecar.
fn store_object(req: &PutRequest, object_path: &Path, meta_path: &Path) -> Result<String, StoreError> {
    let source = File::open(&req.path).map_err(|e| {
        StoreError::Permanent(format!("cannot open {}: {e}", req.path.display()))
    })?;

    for dir in [object_path.parent(), meta_path.parent()].into_iter().flatten() {
        std::fs::create_dir_all(dir).map_err(io_error)?;
    }

    let tmp_path = with_suffix(object_path, ".partial");
    let (sha256, size) = copy_hashing(source, &tmp_path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        io_error(e)
    })?;

    if !sha256.eq_ignore_ascii_case(&req.checksum) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(StoreError::Permanent(format!(
            "content of {} changed since discovery",
            req.path.display()
        )));
    }

    std::fs::rename(&tmp_path, object_path).map_err(io_error)?;

    let etag = format!("\"{}\"", &sha256[..32]);
    let meta = ObjectMeta {
        etag: etag.clone(),
        sha256,
        size,
        content_type: req.content_type.clone(),
        cache_control: req.cache_control.clone(),
        stored_at: Utc::now(),
    };
    let json = serde_json::to_vec_pretty(&meta)
        .map_err(|e| StoreError::Permanent(format!("cannot encode metadata: {e}")))?;
    std::fs::write(meta_path, json).map_err(io_error)?;

    Ok(etag)
}

fn copy_hashing(source: File, dest: &Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, File::create(dest)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
        size += n as u64;
    }
    writer.flush()?;

    Ok((hex::encode(hasher.finalize()), size))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn io_error(e: io::Error) -> StoreError {
    StoreError::Transient(format!("filesystem error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IMMUTABLE_CACHE_CONTROL;
    use tempfile::tempdir;

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn request(path: PathBuf, key: &str, data: &[u8]) -> PutRequest {
        PutRequest {
            key: key.to_string(),
            path,
            content_type: "image/png".to_string(),
            cache_control: IMMUTABLE_CACHE_CONTROL.to_string(),
            checksum: sha256_hex(data),
            size: data.len() as u64,
        }
    }

    #[tokio::test]
    async fn put_then_head_reports_checksum() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("logo.png");
        std::fs::write(&src, b"png bytes").unwrap();

        let store = FsStore::new(temp.path().join("remote"), "media");
        store.check_access().await.unwrap();
        assert!(store.head("imgs/logo.png").await.unwrap().is_none());

        let req = request(src, "imgs/logo.png", b"png bytes");
        let etag = store.put(&req).await.unwrap();

        let found = store.head("imgs/logo.png").await.unwrap().unwrap();
        assert_eq!(found.etag, etag);
        assert_eq!(found.checksum.as_deref(), Some(req.checksum.as_str()));
        assert_eq!(found.size, Some(9));

        let body = std::fs::read(temp.path().join("remote/media/imgs/logo.png")).unwrap();
        assert_eq!(body, b"png bytes");
    }

    #[tokio::test]
    async fn put_rejects_changed_content() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("a.png");
        std::fs::write(&src, b"new content").unwrap();

        let store = FsStore::new(temp.path(), "media");
        let req = request(src, "a.png", b"old content");

        let err = store.put(&req).await.unwrap_err();
        assert!(matches!(err, StoreError::Permanent(_)));
        assert!(store.head("a.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_source_is_permanent() {
        let temp = tempdir().unwrap();
        let store = FsStore::new(temp.path(), "media");
        let req = request(temp.path().join("gone.png"), "gone.png", b"x");

        assert!(matches!(
            store.put(&req).await.unwrap_err(),
            StoreError::Permanent(_)
        ));
    }

    #[test]
    fn keys_cannot_escape_the_bucket() {
        assert!(FsStore::relative_key("../etc/passwd").is_err());
        assert!(FsStore::relative_key("/abs.png").is_err());
        assert!(FsStore::relative_key(".meta/x.json").is_err());
        assert!(FsStore::relative_key("").is_err());
        assert!(FsStore::relative_key("imgs/a.png").is_ok());
    }
}
