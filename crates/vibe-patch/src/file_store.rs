//! JSON documents on disk
//!
//! Resource ids are relative paths under a root directory. Each write goes to
//! a sibling temp file and is renamed into place, so a crash mid-write never
//! leaves a truncated document behind.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use vibe_core::fail_open::fail_open;
use vibe_core::{AppliedRecord, PatchOperation, Result, VibeError};

use crate::document;
use crate::store::ResourceStore;

/// Protected file patterns that must never be patched
const PROTECTED_FILES: &[&str] = &[".git", ".env", ".secrets", ".vibe"];

/// Validate that a resource id is safe to resolve under the store root
pub fn validate_resource_path(file: &str) -> Result<PathBuf> {
    if file.is_empty() {
        return Err(VibeError::PathValidation("empty resource id".to_string()));
    }

    let path = Path::new(file);

    if path.is_absolute() {
        return Err(VibeError::PathValidation(format!(
            "Absolute paths not allowed: {}",
            path.display()
        )));
    }

    for component in path.components() {
        match component {
            Component::Normal(name) => {
                if let Some(protected) = PROTECTED_FILES.iter().find(|p| name.to_str() == Some(**p)) {
                    return Err(VibeError::PathValidation(format!(
                        "Cannot patch protected file ({}): {}",
                        protected,
                        path.display()
                    )));
                }
            }
            Component::ParentDir => {
                return Err(VibeError::PathValidation(format!(
                    "Path traversal not allowed: {}",
                    path.display()
                )));
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {
                return Err(VibeError::PathValidation(format!(
                    "Resource id must be a plain relative path: {}",
                    path.display()
                )));
            }
        }
    }

    Ok(path.to_path_buf())
}

/// File-backed resource store
pub struct JsonFileStore {
    root: PathBuf,
    /// Single writer across all documents under this root
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, file: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_resource_path(file)?))
    }

    async fn load(&self, file: &str) -> Result<(PathBuf, Value)> {
        let path = self.resolve(file)?;
        if !path.exists() {
            return Err(VibeError::DocumentNotFound(file.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        let doc: Value = serde_json::from_str(&content)
            .map_err(|e| VibeError::Application(format!("{} is not valid JSON: {}", file, e)))?;
        Ok((path, doc))
    }

    async fn persist(&self, path: &Path, doc: &Value) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".vibe-tmp");
        let tmp = PathBuf::from(tmp);

        let content = serde_json::to_string_pretty(doc)?;
        fs::write(&tmp, format!("{}\n", content)).await?;

        if let Err(e) = fs::rename(&tmp, path).await {
            fail_open("file_store::remove_temp", || async {
                fs::remove_file(&tmp).await?;
                Ok::<(), VibeError>(())
            })
            .await;
            return Err(e.into());
        }

        debug!("Persisted {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for JsonFileStore {
    #[instrument(skip(self, op), fields(file = %op.file, op = %op.op, path = %op.path))]
    async fn apply(&self, op: &PatchOperation) -> Result<AppliedRecord> {
        let _guard = self.write_lock.lock().await;
        let (path, mut doc) = self.load(&op.file).await?;

        let record = document::apply(&mut doc, op)?;
        self.persist(&path, &doc).await?;

        info!("Applied {} {} to {}", op.op, op.path, op.file);
        Ok(record)
    }

    #[instrument(skip(self, record), fields(file = %record.operation.file, path = %record.operation.path))]
    async fn reverse(&self, record: &AppliedRecord) -> Result<()> {
        let inverse = record.inverse()?;

        let _guard = self.write_lock.lock().await;
        let (path, mut doc) = self.load(&record.operation.file).await?;

        for op in &inverse {
            document::apply(&mut doc, op)?;
        }
        self.persist(&path, &doc).await?;

        info!(
            "Reversed {} {} on {}",
            record.operation.op, record.operation.path, record.operation.file
        );
        Ok(())
    }

    async fn dry_run(&self, op: &PatchOperation) -> Result<AppliedRecord> {
        let (_, mut doc) = self.load(&op.file).await?;
        document::apply(&mut doc, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_doc(dir: &TempDir, name: &str, value: Value) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, serde_json::to_string(&value).unwrap()).unwrap();
    }

    fn read_doc(dir: &TempDir, name: &str) -> Value {
        let content = std::fs::read_to_string(dir.path().join(name)).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn test_apply_persists_and_reverse_restores() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "config/app.json", json!({"name": "vibe"}));

        let store = JsonFileStore::new(dir.path());
        let record = store
            .apply(&PatchOperation::add("config/app.json", "/port", json!(8080)))
            .await
            .unwrap();
        assert_eq!(read_doc(&dir, "config/app.json"), json!({"name": "vibe", "port": 8080}));

        store.reverse(&record).await.unwrap();
        assert_eq!(read_doc(&dir, "config/app.json"), json!({"name": "vibe"}));
        assert!(!dir.path().join("config/app.json.vibe-tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_document() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let result = store.apply(&PatchOperation::add("nope.json", "/a", json!(1))).await;
        assert!(matches!(result, Err(VibeError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn test_dry_run_leaves_file_alone() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "a.json", json!({"a": 1}));

        let store = JsonFileStore::new(dir.path());
        store
            .dry_run(&PatchOperation::remove("a.json", "/a"))
            .await
            .unwrap();
        assert_eq!(read_doc(&dir, "a.json"), json!({"a": 1}));
    }

    #[test]
    fn test_validate_resource_path() {
        assert!(validate_resource_path("docs/a.json").is_ok());
        assert!(validate_resource_path("/etc/passwd").is_err());
        assert!(validate_resource_path("../../etc/passwd").is_err());
        assert!(validate_resource_path(".git/config").is_err());
        assert!(validate_resource_path("nested/.env").is_err());
        assert!(validate_resource_path(".vibe/events.jsonl").is_err());
        assert!(validate_resource_path("").is_err());

        // Protected names anywhere in the path, and `./` prefixes
        assert!(validate_resource_path("./.vibe/events.jsonl").is_err());
        assert!(validate_resource_path("docs/.git/config").is_err());
        assert!(validate_resource_path("./docs/a.json").is_err());
        assert!(validate_resource_path("docs/.gitignore.json").is_ok());
    }

    #[tokio::test]
    async fn test_unparseable_document_is_an_application_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let store = JsonFileStore::new(dir.path());
        let result = store.apply(&PatchOperation::add("broken.json", "/a", json!(1))).await;
        assert!(matches!(result, Err(VibeError::Application(_))));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("broken.json")).unwrap(),
            "{not json"
        );
    }
}
