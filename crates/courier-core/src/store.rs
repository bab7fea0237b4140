use crate::error::CoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexPart {
    Int(u64),
    Text(String),
}

impl From<u64> for IndexPart {
    fn from(value: u64) -> Self {
        IndexPart::Int(value)
    }
}

impl From<&str> for IndexPart {
    fn from(value: &str) -> Self {
        IndexPart::Text(value.to_string())
    }
}

impl From<String> for IndexPart {
    fn from(value: String) -> Self {
        IndexPart::Text(value)
    }
}

pub type IndexKey = Vec<IndexPart>;

pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn key(&self) -> String;

    /// Value of the named secondary index, or `None` if the record is not indexed by it.
    fn index_key(&self, _index: &str) -> Option<IndexKey> {
        None
    }
}

#[async_trait]
pub trait Table<R: Record>: Send + Sync {
    async fn put(&self, record: R) -> Result<(), CoreError>;
    async fn get(&self, key: &str) -> Result<Option<R>, CoreError>;
    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<R>>, CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    /// Records whose index key lies in `lower..=upper`, ordered by index key.
    async fn range(
        &self,
        index: &str,
        lower: IndexKey,
        upper: IndexKey,
    ) -> Result<Vec<R>, CoreError>;
    async fn scan(&self) -> Result<Vec<R>, CoreError>;
}

#[derive(Clone)]
pub struct MemoryTable<R: Record> {
    rows: Arc<Mutex<BTreeMap<String, R>>>,
}

impl<R: Record> Default for MemoryTable<R> {
    fn default() -> Self {
        Self {
            rows: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<R: Record> MemoryTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

fn select_range<R: Record>(
    rows: &BTreeMap<String, R>,
    index: &str,
    lower: &IndexKey,
    upper: &IndexKey,
) -> Vec<R> {
    let mut hits: Vec<(IndexKey, R)> = rows
        .values()
        .filter_map(|row| row.index_key(index).map(|key| (key, row)))
        .filter(|(key, _)| key >= lower && key <= upper)
        .map(|(key, row)| (key, row.clone()))
        .collect();
    hits.sort_by(|a, b| a.0.cmp(&b.0));
    hits.into_iter().map(|(_, row)| row).collect()
}

#[async_trait]
impl<R: Record> Table<R> for MemoryTable<R> {
    async fn put(&self, record: R) -> Result<(), CoreError> {
        self.rows.lock().await.insert(record.key(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<R>, CoreError> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<R>>, CoreError> {
        let guard = self.rows.lock().await;
        Ok(keys.iter().map(|key| guard.get(key).cloned()).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.rows.lock().await.remove(key);
        Ok(())
    }

    async fn range(
        &self,
        index: &str,
        lower: IndexKey,
        upper: IndexKey,
    ) -> Result<Vec<R>, CoreError> {
        let guard = self.rows.lock().await;
        Ok(select_range(&guard, index, &lower, &upper))
    }

    async fn scan(&self) -> Result<Vec<R>, CoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound(deserialize = "R: DeserializeOwned"))]
struct Stored<R: Record> {
    rows: BTreeMap<String, R>,
}

pub struct JsonFileTable<R: Record> {
    path: PathBuf,
    rows: Mutex<BTreeMap<String, R>>,
}

impl<R: Record> JsonFileTable<R> {
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, CoreError> {
        let base = dir.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|_| CoreError::Storage)?;
        let path = base.join(format!("{}.json", name));
        let rows = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|_| CoreError::Storage)?;
            let stored: Stored<R> = serde_json::from_str(&content)?;
            stored.rows
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, rows: &BTreeMap<String, R>) -> Result<(), CoreError> {
        let stored = StoredRef { rows };
        let serialized = serde_json::to_string_pretty(&stored)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized).map_err(|_| CoreError::Storage)?;
        fs::rename(&tmp, &self.path).map_err(|_| CoreError::Storage)
    }
}

#[derive(Serialize)]
struct StoredRef<'a, R: Record> {
    rows: &'a BTreeMap<String, R>,
}

#[async_trait]
impl<R: Record> Table<R> for JsonFileTable<R> {
    async fn put(&self, record: R) -> Result<(), CoreError> {
        let mut guard = self.rows.lock().await;
        guard.insert(record.key(), record);
        self.persist(&guard)
    }

    async fn get(&self, key: &str) -> Result<Option<R>, CoreError> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<R>>, CoreError> {
        let guard = self.rows.lock().await;
        Ok(keys.iter().map(|key| guard.get(key).cloned()).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut guard = self.rows.lock().await;
        if guard.remove(key).is_some() {
            self.persist(&guard)?;
        }
        Ok(())
    }

    async fn range(
        &self,
        index: &str,
        lower: IndexKey,
        upper: IndexKey,
    ) -> Result<Vec<R>, CoreError> {
        let guard = self.rows.lock().await;
        Ok(select_range(&guard, index, &lower, &upper))
    }

    async fn scan(&self) -> Result<Vec<R>, CoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}
