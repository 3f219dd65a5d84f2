//! Filesystem-backed content-addressed blob storage.
//!
//! Blobs live in a sharded directory layout: `path_depth` two-character
//! chunks of the content hash name the intermediate directories and the full
//! hash names the file, e.g. `root/5d/41/5d41402a…`. A blob found at any
//! intermediate depth is accepted as valid, so trees written with a smaller
//! depth remain readable after a configuration change.

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{AppError, Result};
use crate::storage::{BoxReader, Storage, WriteOutcome};
use crate::utils::range::HttpRange;

pub const PATH_CHUNK_LEN: usize = 2;

const WRITE_BUF_LEN: usize = 64 * 1024;

pub struct DirStorage {
    dir: PathBuf,
    path_depth: u8,
    dir_perm: u32,
    file_perm: u32,
}

impl DirStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            dir: config.dir,
            path_depth: config.path_depth,
            dir_perm: config.dir_perm,
            file_perm: config.file_perm,
        }
    }

    /// Resolve the filesystem location of `content_hash`.
    ///
    /// Walks the tree one level at a time, accepting an existing file named
    /// with the full hash at any depth. In `prepare` mode missing
    /// intermediate directories are created with `dir_perm` and the returned
    /// path is the deepest destination for a fresh blob.
    async fn dig(&self, content_hash: &str, prepare: bool) -> Result<(bool, PathBuf)> {
        let hash_len = content_hash.chars().count();
        if hash_len > 512 {
            return Err(AppError::BadRequest(
                "contentHash must be shorter than 512 characters".into(),
            ));
        }
        let depth = self.path_depth as usize;
        if hash_len < depth * PATH_CHUNK_LEN {
            return Err(AppError::BadRequest(
                "contentHash is too short to build full-depth path".into(),
            ));
        }

        let chunk = |i: usize| &content_hash[i * PATH_CHUNK_LEN..(i + 1) * PATH_CHUNK_LEN];

        let mut dir = self.dir.clone();
        let mut exists = false;
        let mut i = 0usize;
        loop {
            match fs::metadata(&dir).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    for j in i..depth {
                        dir.push(chunk(j));
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
                Ok(m) if !m.is_dir() => {
                    return Err(AppError::Internal(format!(
                        "file {} is not a directory",
                        dir.display()
                    )));
                }
                Ok(_) => {}
            }

            let candidate = dir.join(content_hash);
            match fs::metadata(&candidate).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if i < depth {
                        dir.push(chunk(i));
                        i += 1;
                        continue;
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
                Ok(m) if m.is_dir() => {
                    return Err(AppError::Internal(format!(
                        "file {} is a directory",
                        candidate.display()
                    )));
                }
                Ok(_) => {
                    exists = true;
                    break;
                }
            }
        }

        let path = dir.join(content_hash);

        if prepare && !exists {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(self.dir_perm);
            builder.create(&dir).await?;
        }

        Ok((exists, path))
    }

    /// Stream `reader` into the temp file at `temp_path` while computing the
    /// combined MD5 + SHA-1 content hash. The caller removes the temp file on
    /// failure.
    async fn store_temp(
        &self,
        temp_path: &PathBuf,
        reader: &mut BoxReader,
        max_size: i64,
    ) -> Result<(String, i64)> {
        let mut file = fs::File::create(temp_path).await?;
        let mut md5 = Md5::new();
        let mut sha1 = Sha1::new();
        let mut size: i64 = 0;
        let mut buf = vec![0u8; WRITE_BUF_LEN];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            size += n as i64;
            if max_size > 0 && size > max_size {
                return Err(AppError::SizeExceeded {
                    size,
                    limit: max_size,
                });
            }
            md5.update(&buf[..n]);
            sha1.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;

        let content_hash = format!(
            "{}{}",
            hex::encode(md5.finalize()),
            hex::encode(sha1.finalize())
        );
        Ok((content_hash, size))
    }
}

#[async_trait]
impl Storage for DirStorage {
    async fn write(&self, mut reader: BoxReader, max_size: i64) -> Result<WriteOutcome> {
        let temp_path = self.dir.join(format!("asset-{}", Uuid::new_v4()));

        let (content_hash, size) = match self.store_temp(&temp_path, &mut reader, max_size).await {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e.context("store temporary"));
            }
        };

        let (exists, path) = match self.dig(&content_hash, true).await {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(
                    e.context(format!("prepare persistent storage for {content_hash}"))
                );
            }
        };

        if exists {
            fs::remove_file(&temp_path).await?;
            return Ok(WriteOutcome {
                exists: true,
                content_hash,
                size,
            });
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(AppError::Io(e).context(format!(
                "move temp file to {}",
                path.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(self.file_perm)).await?;
        }

        Ok(WriteOutcome {
            exists: false,
            content_hash,
            size,
        })
    }

    async fn open_read(&self, content_hash: &str, range: Option<HttpRange>) -> Result<BoxReader> {
        let (exists, path) = self.dig(content_hash, false).await?;
        if !exists {
            return Err(AppError::NotFound(format!(
                "content {content_hash:?} does not exist"
            )));
        }

        let mut file = fs::File::open(&path).await?;
        match range {
            Some(r) => {
                file.seek(SeekFrom::Start(r.from as u64)).await?;
                Ok(Box::pin(file.take(r.length() as u64)))
            }
            None => Ok(Box::pin(file)),
        }
    }

    async fn check(&self, content_hash: &str) -> Result<bool> {
        let (exists, _) = self.dig(content_hash, false).await?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // md5("hello") || sha1("hello")
    const HELLO_HASH: &str =
        "5d41402abc4b2a76b9719d911017c592aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    fn test_storage(root: &TempDir, path_depth: u8) -> DirStorage {
        DirStorage::new(StorageConfig {
            dir: root.path().to_path_buf(),
            path_depth,
            ..Default::default()
        })
    }

    fn reader(data: &[u8]) -> BoxReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    async fn read_all(mut r: BoxReader) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let root = TempDir::new().unwrap();
        let storage = test_storage(&root, 2);

        let outcome = storage.write(reader(b"hello"), 0).await.unwrap();
        assert!(!outcome.exists);
        assert_eq!(outcome.content_hash, HELLO_HASH);
        assert_eq!(outcome.size, 5);

        let body = read_all(storage.open_read(HELLO_HASH, None).await.unwrap()).await;
        assert_eq!(body, b"hello");

        // sharded layout: root/5d/41/<hash>
        let expected = root.path().join("5d").join("41").join(HELLO_HASH);
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn second_write_is_a_dedup_hit() {
        let root = TempDir::new().unwrap();
        let storage = test_storage(&root, 2);

        let first = storage.write(reader(b"hello"), 0).await.unwrap();
        let second = storage.write(reader(b"hello"), 0).await.unwrap();
        assert!(!first.exists);
        assert!(second.exists);
        assert_eq!(first.content_hash, second.content_hash);

        // no temp files survive under the root
        let mut entries = fs::read_dir(root.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(entry.file_type().await.unwrap().is_dir());
        }
    }

    #[tokio::test]
    async fn size_limit_is_enforced() {
        let root = TempDir::new().unwrap();
        let storage = test_storage(&root, 2);

        let err = storage.write(reader(&[0u8; 100]), 10).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));

        // the aborted temp file was removed
        let mut entries = fs::read_dir(root.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn range_read_returns_the_slice() {
        let root = TempDir::new().unwrap();
        let storage = test_storage(&root, 2);
        let outcome = storage.write(reader(b"hello world"), 0).await.unwrap();

        let range = HttpRange { from: 6, to: 11 };
        let body = read_all(
            storage
                .open_read(&outcome.content_hash, Some(range))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body, b"world");
    }

    #[tokio::test]
    async fn blob_at_shallower_depth_is_found() {
        let root = TempDir::new().unwrap();

        // written with depth 1
        let shallow = test_storage(&root, 1);
        let outcome = shallow.write(reader(b"hello"), 0).await.unwrap();
        assert!(root.path().join("5d").join(HELLO_HASH).is_file());

        // read back with depth 2
        let deep = test_storage(&root, 2);
        assert!(deep.check(&outcome.content_hash).await.unwrap());
        let body = read_all(deep.open_read(&outcome.content_hash, None).await.unwrap()).await;
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let root = TempDir::new().unwrap();
        let storage = test_storage(&root, 2);

        assert!(!storage.check(HELLO_HASH).await.unwrap());
        let err = storage.open_read(HELLO_HASH, None).await.map(|_| ()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn hash_guards() {
        let root = TempDir::new().unwrap();
        let storage = test_storage(&root, 2);

        assert!(storage.check(&"a".repeat(513)).await.is_err());
        assert!(storage.check("abc").await.is_err());
    }
}
