use sha1::{Digest, Sha1};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info};

use crate::crypto::{self, CryptoError};

/// Root folder used when a store is created without one
pub const DEFAULT_ROOT_FOLDER: &str = "distvault_network";

const SHARD_WIDTH: usize = 5;

/// Maps a store key to its location below a namespace directory
pub type PathTransform = Arc<dyn Fn(&str) -> PathKey + Send + Sync>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("namespace {0:?} is not a single directory name")]
    InvalidNamespace(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory part, segments joined by `/`
    pub pathname: String,
    pub filename: String,
}

impl PathKey {
    pub fn first_path_name(&self) -> &str {
        self.pathname.split('/').next().unwrap_or_default()
    }

    pub fn full_path(&self) -> String {
        format!("{}/{}", self.pathname, self.filename)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path())
    }
}

/// Content-addressable layout: the SHA-1 of the key, hex encoded, cut into
/// five character directory segments. The full digest is the filename.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));

    let paths: Vec<&str> = hash
        .as_bytes()
        .chunks(SHARD_WIDTH)
        .filter(|segment| segment.len() == SHARD_WIDTH)
        .map(|segment| std::str::from_utf8(segment).unwrap_or_default())
        .collect();

    PathKey {
        pathname: paths.join("/"),
        filename: hash,
    }
}

/// Identity layout: the key is both the directory and the filename.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        pathname: key.to_string(),
        filename: key.to_string(),
    }
}

#[derive(Clone)]
pub struct StoreOptions {
    /// Folder containing every namespace of this store
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path_transform: Arc::new(cas_path_transform),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            path_transform: Arc::new(default_path_transform),
        }
    }
}

/// On-disk object store. Namespaces keep several nodes apart under one root.
///
/// No internal locking: concurrent writers to one key race at the filesystem
/// level and the last write wins.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    pub fn new(opts: StoreOptions) -> Self {
        let root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT_FOLDER)
        } else {
            opts.root
        };

        Self {
            root,
            path_transform: opts.path_transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    /// Check if the namespace holds `key`. A missing object is `Ok(false)`.
    pub async fn has(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.object_path(namespace, key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write<R>(&self, namespace: &str, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.open_for_writing(namespace, key).await?;
        let n = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;

        debug!("Wrote {} bytes to disk for key {}", n, key);
        Ok(n)
    }

    /// Write `reader` to disk encrypted with `enc_key`.
    pub async fn write_encrypt<R>(
        &self,
        namespace: &str,
        enc_key: &[u8],
        key: &str,
        reader: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.open_for_writing(namespace, key).await?;
        let n = crypto::copy_encrypt(enc_key, reader, &mut file).await?;
        Ok(n)
    }

    /// Decrypt `reader` with `enc_key` and write the plaintext to disk.
    pub async fn write_decrypt<R>(
        &self,
        namespace: &str,
        enc_key: &[u8],
        key: &str,
        reader: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.open_for_writing(namespace, key).await?;
        let n = crypto::copy_decrypt(enc_key, reader, &mut file).await?;
        Ok(n)
    }

    /// Open the object for reading. The caller owns (and closes) the handle.
    pub async fn read(&self, namespace: &str, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.object_path(namespace, key)?;
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Remove only the object file for `key`, leaving its shard directories.
    /// A missing object is not an error.
    pub async fn discard(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(namespace, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the subtree rooted at the key's first path segment.
    ///
    /// With [`cas_path_transform`] that directory only ever holds this key's
    /// shard prefix. Deleting a missing key is not an error.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path_key = self.path_key(key);
        let first = self.namespace_dir(namespace)?.join(path_key.first_path_name());

        match fs::remove_dir_all(&first).await {
            Ok(()) => {
                info!("Deleted [{}] from disk", path_key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the whole root directory tree.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_for_writing(&self, namespace: &str, key: &str) -> Result<File, StoreError> {
        let path_key = self.path_key(key);
        let dir = join_segments(self.namespace_dir(namespace)?, &path_key.pathname);
        fs::create_dir_all(&dir).await?;

        Ok(File::create(dir.join(&path_key.filename)).await?)
    }

    fn object_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        let path_key = self.path_key(key);
        let dir = join_segments(self.namespace_dir(namespace)?, &path_key.pathname);
        Ok(dir.join(&path_key.filename))
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        if namespace.is_empty() {
            return Err(StoreError::EmptyNamespace);
        }

        // exactly one plain component, so the result stays below the root
        let mut components = Path::new(namespace).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single || namespace.contains(['/', '\\']) {
            return Err(StoreError::InvalidNamespace(namespace.to_string()));
        }
        Ok(self.root.join(namespace))
    }
}

fn join_segments(mut base: PathBuf, pathname: &str) -> PathBuf {
    for segment in pathname.split('/').filter(|s| !s.is_empty()) {
        base.push(segment);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_id, new_encryption_key, IV_LEN};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn new_store(temp_dir: &TempDir) -> Store {
        Store::new(StoreOptions::new(temp_dir.path().join("store")))
    }

    async fn read_all(store: &Store, namespace: &str, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(namespace, key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size, buf.len() as u64);
        buf
    }

    #[test]
    fn test_cas_path_transform() {
        let path_key = cas_path_transform("momsbestpicture");

        assert_eq!(path_key.filename, "6804429f74181a63c50c3d81d733a12f14a353ff");
        assert_eq!(path_key.pathname, "68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff");
        assert_eq!(path_key.first_path_name(), "68044");
        assert_eq!(
            path_key.full_path(),
            "68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff/6804429f74181a63c50c3d81d733a12f14a353ff"
        );
    }

    #[test]
    fn test_cas_path_transform_is_deterministic() {
        assert_eq!(cas_path_transform("a key"), cas_path_transform("a key"));
        assert_ne!(cas_path_transform("a key"), cas_path_transform("another key"));
    }

    #[test]
    fn test_default_root_folder() {
        let store = Store::new(StoreOptions::default());
        assert_eq!(store.root(), Path::new(DEFAULT_ROOT_FOLDER));
        assert_eq!(store.path_key("plain").full_path(), "plain/plain");
    }

    #[tokio::test]
    async fn test_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);
        let id = generate_id();

        for i in 0..50 {
            let key = format!("pizza_{}", i);
            let data = b"some jpg bytes";

            let n = store.write(&id, &key, &mut &data[..]).await.unwrap();
            assert_eq!(n, data.len() as u64);
            assert!(store.has(&id, &key).await.unwrap(), "expected to have key {}", key);

            assert_eq!(read_all(&store, &id, &key).await, data.to_vec());

            store.delete(&id, &key).await.unwrap();
            assert!(!store.has(&id, &key).await.unwrap(), "expected to NOT have key {}", key);
        }

        store.clear().await.unwrap();
        assert!(!store.root().exists());
    }

    #[tokio::test]
    async fn test_overwrite_truncates() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("node", "doc", &mut &b"a much longer first version"[..]).await.unwrap();
        store.write("node", "doc", &mut &b"short"[..]).await.unwrap();

        assert_eq!(read_all(&store, "node", "doc").await, b"short".to_vec());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("node", "momspecials", &mut &b"bytes"[..]).await.unwrap();
        store.delete("node", "momspecials").await.unwrap();
        store.delete("node", "momspecials").await.unwrap();
        store.delete("node", "never-written").await.unwrap();
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("alpha", "shared", &mut &b"from alpha"[..]).await.unwrap();
        store.write("beta", "shared", &mut &b"from beta"[..]).await.unwrap();

        store.delete("alpha", "shared").await.unwrap();
        assert!(!store.has("alpha", "shared").await.unwrap());
        assert_eq!(read_all(&store, "beta", "shared").await, b"from beta".to_vec());
    }

    #[tokio::test]
    async fn test_empty_namespace_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        assert_matches!(store.has("", "key").await, Err(StoreError::EmptyNamespace));
        assert_matches!(
            store.write("", "key", &mut &b"x"[..]).await,
            Err(StoreError::EmptyNamespace)
        );
        assert_matches!(store.delete("", "key").await, Err(StoreError::EmptyNamespace));
    }

    #[tokio::test]
    async fn test_namespace_cannot_leave_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);
        let outside = TempDir::new().unwrap();
        let absolute = outside.path().to_string_lossy().to_string();

        for namespace in [absolute.as_str(), "..", ".", "../escape", "a/b", "a\\b", "/"] {
            assert_matches!(
                store.write(namespace, "x", &mut &b"bytes"[..]).await,
                Err(StoreError::InvalidNamespace(_))
            );
            assert_matches!(store.has(namespace, "x").await, Err(StoreError::InvalidNamespace(_)));
        }

        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
        assert!(!temp_dir.path().join("escape").exists());
        assert!(store.write("node-1.a", "x", &mut &b"ok"[..]).await.is_ok());
    }

    #[tokio::test]
    async fn test_discard_removes_only_the_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("node", "doc", &mut &b"bytes"[..]).await.unwrap();
        store.discard("node", "doc").await.unwrap();
        assert!(!store.has("node", "doc").await.unwrap());
        store.discard("node", "doc").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        assert_matches!(store.read("node", "missing").await, Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_write_encrypt_then_decrypt() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);
        let key = new_encryption_key();
        let data = b"encrypted at rest";

        let n = store.write_encrypt("node", &key, "secret", &mut &data[..]).await.unwrap();
        assert_eq!(n, (data.len() + IV_LEN) as u64);

        let ciphertext = read_all(&store, "node", "secret").await;
        assert_ne!(&ciphertext[IV_LEN..], &data[..]);

        let n = store
            .write_decrypt("node", &key, "plain", &mut ciphertext.as_slice())
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(read_all(&store, "node", "plain").await, data.to_vec());
    }

    #[tokio::test]
    async fn test_custom_transform_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::new(StoreOptions {
            root: temp_dir.path().to_path_buf(),
            path_transform: Arc::new(default_path_transform),
        });

        store.write("node", "notes", &mut &b"hi"[..]).await.unwrap();
        assert!(temp_dir.path().join("node").join("notes").join("notes").is_file());
    }
}
