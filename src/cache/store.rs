//! On-disk payloads behind cache entries
//!
//! Objects live at `<root>/objects/<shard>/<id>` where the shard is the
//! first two characters of the id. Writes go through a temp file in the
//! same shard directory and a rename, so a reader either sees a complete
//! object or none.

use crate::cache::entry::EntryId;
use crate::error::{CairnError, CairnResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Storage that materializes entry payloads
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `id`, returning the bytes written
    async fn put(&self, id: &EntryId, bytes: &[u8]) -> CairnResult<u64>;

    /// Read the object for `id`. A missing object is `EntryNotFound`.
    async fn get(&self, id: &EntryId) -> CairnResult<Vec<u8>>;

    /// Delete the object for `id`. Removing a missing object succeeds.
    async fn remove(&self, id: &EntryId) -> CairnResult<()>;
}

/// Sharded directory of objects
#[derive(Debug, Clone)]
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> CairnResult<Self> {
        let root = root.into();
        let objects = root.join("objects");
        fs::create_dir_all(&objects)
            .await
            .map_err(|e| CairnError::io(format!("creating {}", objects.display()), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, id: &EntryId) -> PathBuf {
        self.root.join("objects").join(id.shard()).join(id.as_str())
    }

    pub async fn contains(&self, id: &EntryId) -> bool {
        fs::metadata(self.object_path(id)).await.is_ok()
    }

    /// Ids of every stored object. Temp files and foreign names are
    /// skipped.
    pub async fn object_ids(&self) -> CairnResult<Vec<EntryId>> {
        let objects = self.root.join("objects");
        let mut ids = Vec::new();
        let mut shards = read_dir(&objects).await?;
        while let Some(shard) = next_entry(&mut shards, &objects).await? {
            if !shard.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let shard_path = shard.path();
            let mut files = read_dir(&shard_path).await?;
            while let Some(file) = next_entry(&mut files, &shard_path).await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if let Ok(id) = EntryId::parse(&name) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Copy a host file into the store
    pub async fn put_file(&self, id: &EntryId, src: &Path) -> CairnResult<u64> {
        let bytes = fs::read(src)
            .await
            .map_err(|e| CairnError::io(format!("reading {}", src.display()), e))?;
        self.put(id, &bytes).await
    }
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn put(&self, id: &EntryId, bytes: &[u8]) -> CairnResult<u64> {
        let path = self.object_path(id);
        let shard = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join("objects"));
        fs::create_dir_all(&shard)
            .await
            .map_err(|e| CairnError::io(format!("creating {}", shard.display()), e))?;

        let tmp = shard.join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(CairnError::io(format!("writing object {}", path.display()), e));
        }

        debug!("Stored object {} ({} bytes)", id, bytes.len());
        Ok(bytes.len() as u64)
    }

    async fn get(&self, id: &EntryId) -> CairnResult<Vec<u8>> {
        let path = self.object_path(id);
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => CairnError::EntryNotFound(id.to_string()),
            _ => CairnError::io(format!("reading object {}", path.display()), e),
        })
    }

    async fn remove(&self, id: &EntryId) -> CairnResult<()> {
        let path = self.object_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed object {}", id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CairnError::io(
                format!("removing object {}", path.display()),
                e,
            )),
        }
    }
}

async fn read_dir(path: &Path) -> CairnResult<fs::ReadDir> {
    fs::read_dir(path)
        .await
        .map_err(|e| CairnError::io(format!("listing {}", path.display()), e))
}

async fn next_entry(dir: &mut fs::ReadDir, path: &Path) -> CairnResult<Option<fs::DirEntry>> {
    dir.next_entry()
        .await
        .map_err(|e| CairnError::io(format!("listing {}", path.display()), e))
}
