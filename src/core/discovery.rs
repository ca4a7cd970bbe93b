//! Finds migratable media under the source roots and describes each file.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::models::{AssetCategory, AssetDescriptor};

const HASH_BUFFER_SIZE: usize = 128 * 1024;
const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("source directory not found: {0}")]
    MissingSource(PathBuf),
    #[error("{path} is not inside the public directory {public_dir}")]
    OutsidePublicDir { path: PathBuf, public_dir: PathBuf },
    #[error("two files map to remote key `{0}`")]
    DuplicateKey(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("discovery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Walk every source root and build descriptors in a stable order: roots
/// in the order given, entries sorted by file name within each directory.
///
/// Hashing is blocking work and runs on the blocking pool.
pub async fn discover_all(
    sources: &[PathBuf],
    public_dir: &Path,
) -> Result<Vec<AssetDescriptor>, DiscoveryError> {
    for source in sources {
        if !source.is_dir() {
            return Err(DiscoveryError::MissingSource(source.clone()));
        }
    }

    let sources = sources.to_vec();
    let public_dir = public_dir.to_path_buf();

    tokio::task::spawn_blocking(move || discover_blocking(&sources, &public_dir)).await?
}

fn discover_blocking(
    sources: &[PathBuf],
    public_dir: &Path,
) -> Result<Vec<AssetDescriptor>, DiscoveryError> {
    let mut assets = Vec::new();
    let mut seen = HashSet::new();

    for source in sources {
        let before = assets.len();
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.clone());
                DiscoveryError::Io {
                    path,
                    source: e.into(),
                }
            })?;

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(category) = category_of(entry.path()) else {
                continue;
            };

            let asset = describe(entry.path(), public_dir, category)?;
            if !seen.insert(asset.remote_key.clone()) {
                return Err(DiscoveryError::DuplicateKey(asset.remote_key));
            }
            debug!(remote_key = %asset.remote_key, size = asset.size_bytes, "Discovered asset");
            assets.push(asset);
        }
        info!(source = %source.display(), files = assets.len() - before, "Scanned source");
    }

    Ok(assets)
}

fn category_of(path: &Path) -> Option<AssetCategory> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(AssetCategory::from_extension)
}

/// Build the descriptor for one file. The remote key is the path relative
/// to `public_dir`, always `/`-separated.
pub fn describe(
    path: &Path,
    public_dir: &Path,
    category: AssetCategory,
) -> Result<AssetDescriptor, DiscoveryError> {
    let local_path = std::path::absolute(path).map_err(|source| DiscoveryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let public_abs = std::path::absolute(public_dir).map_err(|source| DiscoveryError::Io {
        path: public_dir.to_path_buf(),
        source,
    })?;

    let remote_key = remote_key_for(&local_path, &public_abs)?;

    let metadata = std::fs::metadata(&local_path).map_err(|source| DiscoveryError::Io {
        path: local_path.clone(),
        source,
    })?;
    let checksum = sha256_file(&local_path).map_err(|source| DiscoveryError::Io {
        path: local_path.clone(),
        source,
    })?;
    let mime_type = mime_guess::from_path(&local_path)
        .first_raw()
        .unwrap_or(FALLBACK_MIME)
        .to_string();

    Ok(AssetDescriptor {
        local_path,
        remote_key,
        size_bytes: metadata.len(),
        mime_type,
        checksum,
        category,
    })
}

fn remote_key_for(path: &Path, public_dir: &Path) -> Result<String, DiscoveryError> {
    let relative = path
        .strip_prefix(public_dir)
        .map_err(|_| DiscoveryError::OutsidePublicDir {
            path: path.to_path_buf(),
            public_dir: public_dir.to_path_buf(),
        })?;

    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub fn checksums_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sha256_of_known_content() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn checksum_comparison_ignores_case() {
        assert!(checksums_match("ABCDEF", "abcdef"));
        assert!(!checksums_match("abcdef", "abcdee"));
    }

    #[tokio::test]
    async fn discovers_supported_files_in_stable_order() {
        let temp = tempdir().unwrap();
        let public = temp.path().join("public");
        let imgs = public.join("imgs");
        let videos = public.join("videos");
        std::fs::create_dir_all(imgs.join("team")).unwrap();
        std::fs::create_dir_all(&videos).unwrap();

        std::fs::write(imgs.join("b.PNG"), b"png").unwrap();
        std::fs::write(imgs.join("a.jpg"), b"jpeg").unwrap();
        std::fs::write(imgs.join("notes.txt"), b"skip me").unwrap();
        std::fs::write(imgs.join("team/c.webp"), b"webp").unwrap();
        std::fs::write(videos.join("tour.mp4"), b"mp4 data").unwrap();

        let assets = discover_all(&[imgs, videos], &public).await.unwrap();
        let keys: Vec<&str> = assets.iter().map(|a| a.remote_key.as_str()).collect();

        assert_eq!(
            keys,
            vec!["imgs/a.jpg", "imgs/b.PNG", "imgs/team/c.webp", "videos/tour.mp4"]
        );
        assert_eq!(assets[0].mime_type, "image/jpeg");
        assert_eq!(assets[0].size_bytes, 4);
        assert_eq!(assets[3].category, AssetCategory::Video);
        assert_eq!(assets[3].mime_type, "video/mp4");
        assert!(assets.iter().all(|a| a.local_path.is_absolute()));
    }

    #[tokio::test]
    async fn missing_source_is_rejected() {
        let temp = tempdir().unwrap();
        let err = discover_all(&[temp.path().join("nope")], temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MissingSource(_)));
    }

    #[tokio::test]
    async fn overlapping_roots_produce_duplicate_key_error() {
        let temp = tempdir().unwrap();
        let public = temp.path().join("public");
        let imgs = public.join("imgs");
        std::fs::create_dir_all(&imgs).unwrap();
        std::fs::write(imgs.join("a.jpg"), b"x").unwrap();

        let err = discover_all(&[public.clone(), imgs], &public)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::DuplicateKey(key) if key == "imgs/a.jpg"));
    }

    #[tokio::test]
    async fn files_outside_public_dir_are_rejected() {
        let temp = tempdir().unwrap();
        let elsewhere = temp.path().join("elsewhere");
        std::fs::create_dir_all(&elsewhere).unwrap();
        std::fs::write(elsewhere.join("a.jpg"), b"x").unwrap();

        let err = discover_all(&[elsewhere], &temp.path().join("public"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::OutsidePublicDir { .. }));
    }
}
