use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("value not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("stored value is malformed: {0}")]
    Serialization(String),
}

/// String key/value persistence in the spirit of browser local storage.
pub trait KeyValueStore: Send + Sync {
    fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn get_value(&self, key: &str) -> Result<String, StoreError>;

    fn delete_value(&self, key: &str) -> Result<(), StoreError>;

    /// All keys currently present, in ascending order.
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set_value(key, value)
    }

    fn get_value(&self, key: &str) -> Result<String, StoreError> {
        (**self).get_value(key)
    }

    fn delete_value(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete_value(key)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        (**self).keys()
    }
}

#[derive(Clone, Default, Debug)]
pub struct InMemoryStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl KeyValueStore for InMemoryStore {
    fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<String, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn delete_value(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        if data.remove(key).is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.keys().cloned().collect())
    }
}

/// One file per key under a directory. Writes go through a temp file and rename.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

const FILE_SUFFIX: &str = ".json";

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(StoreError::Backend(format!("unsupported key '{key}'")));
        }
        Ok(self.root.join(format!("{key}{FILE_SUFFIX}")))
    }

    fn temp_path_for(&self, path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("value.json");
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        self.root.join(format!(".{file_name}.{now_nanos}.tmp"))
    }
}

fn io_error(action: &str, path: &Path, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return StoreError::Unavailable(format!("{action} {}: {err}", path.display()));
    }
    StoreError::Backend(format!("{action} {}: {err}", path.display()))
}

impl KeyValueStore for FileStore {
    fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root)
            .map_err(|err| io_error("failed creating store directory", &self.root, err))?;

        let temp_path = self.temp_path_for(&path);
        fs::write(&temp_path, value)
            .map_err(|err| io_error("failed writing temp value", &temp_path, err))?;

        if let Err(rename_err) = fs::rename(&temp_path, &path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(StoreError::Backend(format!(
                        "failed replacing {} after rename error ({rename_err}): {err}",
                        path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                io_error("failed writing value", &path, err)
            })?;
        }
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<String, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(io_error("failed reading value", &path, err)),
        }
    }

    fn delete_value(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(io_error("failed deleting value", &path, err)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("failed listing store", &self.root, err)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error("failed listing store", &self.root, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(FILE_SUFFIX) {
                keys.push(key.to_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Prefixes every key with `<namespace>-`.
#[derive(Clone, Debug)]
pub struct ScopedStore<S: KeyValueStore> {
    inner: S,
    namespace: String,
}

impl<S: KeyValueStore> ScopedStore<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}-{key}", self.namespace)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_value(&self.scoped(key), value)
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.inner.get_value(&self.scoped(key))
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_value(&self.scoped(key))
    }

    /// Unscoped names of the keys in this namespace.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}-", self.namespace);
        Ok(self
            .inner
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_owned))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_roundtrip() {
        let store = InMemoryStore::default();
        store
            .set_value("rag-chat-session-id", "abc")
            .expect("set should work");
        assert_eq!(
            store.get_value("rag-chat-session-id").expect("get should work"),
            "abc"
        );

        store
            .delete_value("rag-chat-session-id")
            .expect("delete should work");
        assert_eq!(
            store.get_value("rag-chat-session-id"),
            Err(StoreError::NotFound)
        );
    }

    #[test]
    fn scoped_store_isolates_namespaces() {
        let base = InMemoryStore::default();
        let a = ScopedStore::new(base.clone(), "rag-chat");
        let b = ScopedStore::new(base.clone(), "other");

        a.set("preferences", "one").expect("set a");
        b.set("preferences", "two").expect("set b");

        assert_eq!(a.get("preferences").expect("get a"), "one");
        assert_eq!(b.get("preferences").expect("get b"), "two");
        assert_eq!(a.keys().expect("keys"), vec!["preferences".to_owned()]);
        assert_eq!(
            base.get_value("rag-chat-preferences").expect("raw key"),
            "one"
        );
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("nested"));
        store
            .set_value("rag-chat-preferences", "{\"theme\":\"dark\"}")
            .expect("set should work");
        store
            .set_value("rag-chat-preferences", "{\"theme\":\"light\"}")
            .expect("overwrite should work");

        let reopened = FileStore::new(dir.path().join("nested"));
        assert_eq!(
            reopened
                .get_value("rag-chat-preferences")
                .expect("get should work"),
            "{\"theme\":\"light\"}"
        );
        assert_eq!(
            reopened.keys().expect("keys"),
            vec!["rag-chat-preferences".to_owned()]
        );

        reopened
            .delete_value("rag-chat-preferences")
            .expect("delete should work");
        assert_eq!(
            reopened.delete_value("rag-chat-preferences"),
            Err(StoreError::NotFound)
        );
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        assert!(store.set_value("../escape", "x").is_err());
        assert!(store.set_value("", "x").is_err());
        assert_eq!(store.keys().expect("keys"), Vec::<String>::new());
    }

    #[test]
    fn missing_directory_lists_no_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("absent"));
        assert_eq!(store.keys().expect("keys"), Vec::<String>::new());
        assert_eq!(store.get_value("anything"), Err(StoreError::NotFound));
    }

    #[derive(Default)]
    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn set_value(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }

        fn get_value(&self, _key: &str) -> Result<String, StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }

        fn delete_value(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }

        fn keys(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn mock_failure_propagates_through_scoped_store() {
        let scoped = ScopedStore::new(FailingStore, "rag-chat");
        let err = scoped.set("session-id", "x").expect_err("set must fail");
        assert_eq!(err, StoreError::Unavailable("mock outage".to_owned()));
    }
}
