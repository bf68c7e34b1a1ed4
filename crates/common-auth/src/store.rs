//! Key-value stores holding a single JSON object.
//!
//! [`JsonFileStore`] is the production backing. Every read-modify-write cycle
//! runs under two locks: an in-process async `RwLock` so tasks of one service
//! queue up without parking blocking threads, and an advisory `flock` on a
//! sidecar `<file>.lock` so separate processes sharing the volume serialize
//! too. New content is staged in a temp file in the same directory, synced,
//! and renamed over the target, so readers only ever see a complete object.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

/// Whole-store snapshot, ordered by key.
pub type Mapping<V> = BTreeMap<String, V>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store {path} does not hold a well-formed JSON object: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode store {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store worker for {path} stopped: {reason}")]
    Worker { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait KeyValueStore<V>: Send + Sync
where
    V: Send + 'static,
{
    /// Full snapshot of the store.
    async fn load(&self) -> Result<Mapping<V>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        Ok(self.load().await?.remove(key))
    }

    /// Set or overwrite the entry for `key`.
    async fn upsert(&self, key: &str, value: V) -> Result<(), StoreError>;

    /// Insert `value` only if `key` is absent. Returns `false` when an entry
    /// already existed, in which case the store is left untouched.
    async fn insert_new(&self, key: &str, value: V) -> Result<bool, StoreError>;
}

#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: Mutex<Mapping<V>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Mapping::new()),
        }
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.into(), value))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Mapping<V>, StoreError> {
        Ok(self.entries.lock().await.clone())
    }

    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn upsert(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn insert_new(&self, key: &str, value: V) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}

/// A store persisted as one JSON object in a file on a shared volume.
pub struct JsonFileStore<V> {
    inner: Arc<FileInner>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for JsonFileStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _value: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for JsonFileStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

struct FileInner {
    path: PathBuf,
    lock_path: PathBuf,
    gate: RwLock<()>,
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Holds the advisory lock; it is released when the descriptor closes.
struct FileLock {
    _file: File,
}

impl<V> JsonFileStore<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock_path = sidecar_lock_path(&path);
        Self {
            inner: Arc::new(FileInner {
                path,
                lock_path,
                gate: RwLock::new(()),
            }),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Create the backing file as `{}` if it does not exist yet. Returns
    /// whether the file was created.
    pub async fn ensure_exists(&self) -> Result<bool, StoreError> {
        let _write = self.inner.gate.write().await;
        self.blocking(|inner| {
            let _lock = inner.lock(LockMode::Exclusive)?;
            if inner.path.exists() {
                return Ok(false);
            }
            inner.write_mapping(&Mapping::<serde_json::Value>::new())?;
            tracing::info!(path = %inner.path.display(), "created empty store file");
            Ok(true)
        })
        .await
    }

    /// Run one read-modify-write cycle. `apply` returns the caller's result and
    /// whether the mapping changed; unchanged mappings are not rewritten.
    async fn modify<T, F>(&self, apply: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Mapping<V>) -> (T, bool) + Send + 'static,
    {
        let _write = self.inner.gate.write().await;
        self.blocking(move |inner| {
            let _lock = inner.lock(LockMode::Exclusive)?;
            let mut mapping = inner.read_mapping::<V>()?.unwrap_or_default();
            let (outcome, changed) = apply(&mut mapping);
            if changed {
                inner.write_mapping(&mapping)?;
            }
            Ok(outcome)
        })
        .await
    }

    async fn blocking<T, F>(&self, job: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&FileInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || job(&inner))
            .await
            .map_err(|err| StoreError::Worker {
                path: self.inner.path.clone(),
                reason: err.to_string(),
            })?
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for JsonFileStore<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    async fn load(&self) -> Result<Mapping<V>, StoreError> {
        let read = self.inner.gate.read().await;
        let snapshot = self
            .blocking(|inner| {
                let _lock = inner.lock(LockMode::Shared)?;
                inner.read_mapping::<V>()
            })
            .await?;
        drop(read);

        match snapshot {
            Some(mapping) => Ok(mapping),
            None => {
                self.ensure_exists().await?;
                Ok(Mapping::new())
            }
        }
    }

    async fn upsert(&self, key: &str, value: V) -> Result<(), StoreError> {
        let key = key.to_string();
        self.modify(move |mapping| {
            mapping.insert(key, value);
            ((), true)
        })
        .await
    }

    async fn insert_new(&self, key: &str, value: V) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.modify(move |mapping| {
            if mapping.contains_key(&key) {
                return (false, false);
            }
            mapping.insert(key, value);
            (true, true)
        })
        .await
    }
}

impl FileInner {
    fn lock(&self, mode: LockMode) -> Result<FileLock, StoreError> {
        if let Some(parent) = non_empty_parent(&self.lock_path) {
            fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
        }
        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o666);
        }
        let file = options
            .open(&self.lock_path)
            .map_err(|err| StoreError::io(&self.lock_path, err))?;
        flock(&file, mode).map_err(|err| StoreError::io(&self.lock_path, err))?;
        Ok(FileLock { _file: file })
    }

    /// `None` when the file does not exist. Whitespace-only content reads as
    /// an empty mapping.
    fn read_mapping<V: DeserializeOwned>(&self) -> Result<Option<Mapping<V>>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Some(Mapping::new()));
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    fn write_mapping<V: Serialize>(&self, mapping: &Mapping<V>) -> Result<(), StoreError> {
        let dir = non_empty_parent(&self.path).unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|err| StoreError::io(dir, err))?;

        let mut bytes = serde_json::to_vec(mapping).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        bytes.push(b'\n');

        let prefix = staging_prefix(&self.path);
        let mut staged = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|err| StoreError::io(dir, err))?;
        staged
            .write_all(&bytes)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|err| StoreError::io(staged.path(), err))?;

        // Temp files are created 0600; other services on the volume must read it.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))
                .map_err(|err| StoreError::io(staged.path(), err))?;
        }

        staged
            .persist(&self.path)
            .map_err(|err| StoreError::io(&self.path, err.error))?;

        #[cfg(unix)]
        {
            if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
                tracing::debug!(dir = %dir.display(), error = %err, "failed to sync store directory");
            }
        }

        Ok(())
    }
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|parent| !parent.as_os_str().is_empty())
}

fn file_name_or_default(path: &Path) -> OsString {
    path.file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_else(|| OsString::from("store"))
}

fn sidecar_lock_path(path: &Path) -> PathBuf {
    let mut name = file_name_or_default(path);
    name.push(".lock");
    path.with_file_name(name)
}

fn staging_prefix(path: &Path) -> OsString {
    let mut prefix = OsString::from(".");
    prefix.push(file_name_or_default(path));
    prefix.push(".");
    prefix
}

#[cfg(unix)]
fn flock(file: &File, mode: LockMode) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let operation = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _mode: LockMode) -> io::Result<()> {
    Ok(())
}
