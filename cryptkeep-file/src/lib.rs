//! Directory-backed object store for `cryptkeep`.
//!
//! This store keeps every object in the filesystem and is suitable for
//! development and testing environments.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cryptkeep::error::StoreError;
use cryptkeep::ids::ObjectId;
use cryptkeep::store::{Feature, ObjectStore};
use cryptkeep::txg::TxContext;
use parking_lot::Mutex;
use tracing::debug;

const RECORD_EXT: &str = "rec";

/// File-based object store.
///
/// Objects are stored with the following structure:
/// ```text
/// store/
/// ├── next_object         (last allocated object number)
/// ├── features/
/// │   └── encryption      (feature reference count)
/// └── objects/
///     └── 12/
///         ├── 5.rec       (value of key 5, 0600 permissions)
///         └── 9.rec
/// ```
///
/// Every write goes to a temporary file that is renamed into place.
pub struct FileObjectStore {
    root: PathBuf,
    alloc: Mutex<()>,
}

impl FileObjectStore {
    /// Opens an initialized store directory.
    ///
    /// # Arguments
    ///
    /// * `root` - Directory created by [`FileObjectStore::init`]
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupt` if the directory is not an initialized
    /// store.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.join("next_object").is_file() || !root.join("objects").is_dir() {
            return Err(StoreError::Corrupt(format!(
                "not an object store: {}",
                root.display()
            )));
        }
        Ok(Self {
            root,
            alloc: Mutex::new(()),
        })
    }

    /// Lays out an empty store in `root` and opens it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directories cannot be created.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("features"))?;
        if !root.join("next_object").exists() {
            write_atomic(&root.join("next_object"), b"0")?;
        }
        debug!(root = %root.display(), "initialized object store");
        Self::open(root)
    }

    fn object_dir(&self, obj: ObjectId) -> PathBuf {
        self.root.join("objects").join(obj.to_string())
    }

    fn existing_object_dir(&self, obj: ObjectId) -> Result<PathBuf, StoreError> {
        let dir = self.object_dir(obj);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StoreError::NoSuchObject(obj))
        }
    }

    fn feature_path(&self, feature: Feature) -> PathBuf {
        self.root.join("features").join(feature.name())
    }

    fn set_feature_count(&self, feature: Feature, count: u64) -> Result<(), StoreError> {
        write_atomic(&self.feature_path(feature), count.to_string().as_bytes())
    }
}

fn record_name(key: u64) -> String {
    format!("{key}.{RECORD_EXT}")
}

fn read_counter(path: &Path) -> Result<u64, StoreError> {
    let text = fs::read_to_string(path)?;
    text.trim().parse().map_err(|e| {
        StoreError::Corrupt(format!("bad counter in {}: {e}", path.display()))
    })
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl ObjectStore for FileObjectStore {
    fn create_object(&self, _tx: &TxContext) -> Result<ObjectId, StoreError> {
        let _alloc = self.alloc.lock();
        let counter = self.root.join("next_object");
        let obj = ObjectId(read_counter(&counter)? + 1);
        fs::create_dir(self.object_dir(obj))?;
        write_atomic(&counter, obj.to_string().as_bytes())?;
        Ok(obj)
    }

    fn destroy_object(&self, obj: ObjectId, _tx: &TxContext) -> Result<(), StoreError> {
        fs::remove_dir_all(self.existing_object_dir(obj)?)?;
        Ok(())
    }

    fn get(&self, obj: ObjectId, key: u64) -> Result<Vec<u8>, StoreError> {
        let path = self.existing_object_dir(obj)?.join(record_name(key));
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NoSuchKey { obj, key },
            _ => StoreError::Io(e),
        })
    }

    fn put(
        &self,
        obj: ObjectId,
        key: u64,
        value: &[u8],
        _tx: &TxContext,
    ) -> Result<(), StoreError> {
        let path = self.existing_object_dir(obj)?.join(record_name(key));
        write_atomic(&path, value)
    }

    fn delete(&self, obj: ObjectId, key: u64, _tx: &TxContext) -> Result<(), StoreError> {
        let path = self.existing_object_dir(obj)?.join(record_name(key));
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NoSuchKey { obj, key },
            _ => StoreError::Io(e),
        })
    }

    fn iterate(&self, obj: ObjectId) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let dir = self.existing_object_dir(obj)?;
        let mut values = Vec::new();
        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let key = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("unexpected record {}", path.display()))
                })?;
            values.push((key, fs::read(&path)?));
        }
        Ok(values)
    }

    fn feature_incr(&self, feature: Feature, _tx: &TxContext) -> Result<(), StoreError> {
        let _alloc = self.alloc.lock();
        let count = self.feature_refcount(feature)?;
        self.set_feature_count(feature, count + 1)
    }

    fn feature_decr(&self, feature: Feature, _tx: &TxContext) -> Result<(), StoreError> {
        let _alloc = self.alloc.lock();
        let count = self.feature_refcount(feature)?;
        if count == 0 {
            return Err(StoreError::Corrupt(format!(
                "feature {} refcount would go negative",
                feature.name()
            )));
        }
        self.set_feature_count(feature, count - 1)
    }

    fn feature_refcount(&self, feature: Feature) -> Result<u64, StoreError> {
        let path = self.feature_path(feature);
        if !path.exists() {
            return Ok(0);
        }
        read_counter(&path)
    }
}

impl std::fmt::Debug for FileObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObjectStore").field("root", &self.root).finish_non_exhaustive()
    }
}
