use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{ports::PropertyStore, Result};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// One writer lock per file path, shared by every store opened on it.
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(path.to_path_buf()).or_default().clone()
}

/// Durable property store backed by a single JSON object file.
///
/// Every `set` rewrites the whole file through a temp file + rename, so a
/// reader never sees a half-written value. Writers in one process are
/// serialized per path; separate processes must not share a file.
#[derive(Debug)]
pub struct JsonFilePropertyStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonFilePropertyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            write_lock: path_lock(&path),
            path,
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.{seq}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let txt = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if txt.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&txt)?)
    }

    /// Caller holds `write_lock`.
    async fn write_all(&self, all: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, serde_json::to_string_pretty(all)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for JsonFilePropertyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(key.to_string(), value.to_string());
        self.write_all(&all).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        if all.remove(key).is_some() {
            self.write_all(&all).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}/props.json"))
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let s = JsonFilePropertyStore::new(tmp("rrb-props-missing"));
        assert_eq!(s.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_replaces_value_and_keeps_other_keys() {
        let s = JsonFilePropertyStore::new(tmp("rrb-props"));
        s.set("a", "1").await.unwrap();
        s.set("b", "2").await.unwrap();
        s.set("a", "3").await.unwrap();

        assert_eq!(s.get("a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(s.get("b").await.unwrap().as_deref(), Some("2"));

        let reopened = JsonFilePropertyStore::new(s.path().to_path_buf());
        assert_eq!(reopened.get("a").await.unwrap().as_deref(), Some("3"));

        let leftovers = std::fs::read_dir(s.path().parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);

        s.remove("a").await.unwrap();
        s.remove("missing").await.unwrap();
        assert_eq!(s.get("a").await.unwrap(), None);
        assert_eq!(s.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stores_on_one_path_do_not_lose_each_others_writes() {
        let path = tmp("rrb-props-shared");
        let windows = Arc::new(JsonFilePropertyStore::new(path.clone()));
        let names = Arc::new(JsonFilePropertyStore::new(path.clone()));

        let w = windows.clone();
        let churn = tokio::spawn(async move {
            for i in 0..100 {
                w.set(&format!("rate:U{}", i % 5), &i.to_string()).await.unwrap();
            }
        });
        for v in 0..50 {
            let map = format!(r#"{{"doc-{v}":"f{v}.pdf"}}"#);
            names.set("DOC_NAME_MAP", &map).await.unwrap();
            assert_eq!(names.get("DOC_NAME_MAP").await.unwrap(), Some(map));
        }
        churn.await.unwrap();

        let reopened = JsonFilePropertyStore::new(path);
        assert_eq!(
            reopened.get("DOC_NAME_MAP").await.unwrap().as_deref(),
            Some(r#"{"doc-49":"f49.pdf"}"#)
        );
        assert_eq!(reopened.get("rate:U4").await.unwrap().as_deref(), Some("99"));
    }
}
