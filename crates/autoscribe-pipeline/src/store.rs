//! Checkpoint persistence for stage outputs.
//!
//! An [`ArtifactStore`] holds at most one artifact per (task, stage). The
//! orchestrator consults it before invoking a worker, which is what makes a
//! re-run of a partially completed task resume instead of starting over.
//!
//! [`FsArtifactStore`] lays artifacts out as
//! `<root>/<story_id>/<test_id>/<test_id>_<checkpoint_name>_output.json` and
//! replaces them atomically (temporary sibling + rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use autoscribe_types::{Artifact, AutoscribeError, Result, Stage, StagePayload, TaskIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// ArtifactStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether a checkpoint exists. Never mutates the store.
    async fn exists(&self, task: &TaskIdentity, stage: Stage) -> Result<bool>;

    /// Load a checkpoint. Fails with `NotFound` when absent and
    /// `CorruptArtifact` when it cannot be decoded for `stage`.
    async fn read(&self, task: &TaskIdentity, stage: Stage) -> Result<Artifact>;

    /// Create or atomically replace the checkpoint for (task, stage).
    async fn write(
        &self,
        task: &TaskIdentity,
        stage: Stage,
        payload: StagePayload,
    ) -> Result<Artifact>;

    /// Remove every checkpoint of `task`.
    async fn clear(&self, task: &TaskIdentity) -> Result<()>;

    /// Stages that currently have a checkpoint, in pipeline order.
    async fn completed_stages(&self, task: &TaskIdentity) -> Result<Vec<Stage>> {
        let mut done = Vec::new();
        for stage in Stage::ALL {
            if self.exists(task, stage).await? {
                done.push(stage);
            }
        }
        Ok(done)
    }
}

fn ensure_owned(stage: Stage, payload: &StagePayload) -> Result<()> {
    if payload.stage() != stage {
        return Err(AutoscribeError::StageMismatch {
            stage,
            found: payload.stage(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// On-disk envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    story_id: String,
    test_id: String,
    stage: Stage,
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

/// File-backed store rooted at a checkpoint directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every checkpoint of `task`.
    pub fn task_dir(&self, task: &TaskIdentity) -> PathBuf {
        self.root.join(&task.story_id).join(&task.test_id)
    }

    /// Deterministic location of the (task, stage) checkpoint.
    pub fn artifact_path(&self, task: &TaskIdentity, stage: Stage) -> PathBuf {
        self.task_dir(task).join(format!(
            "{}_{}_output.json",
            task.test_id,
            stage.checkpoint_name()
        ))
    }

    fn corrupt(
        &self,
        task: &TaskIdentity,
        stage: Stage,
        path: &Path,
        reason: impl Into<String>,
    ) -> AutoscribeError {
        AutoscribeError::CorruptArtifact {
            task: task.clone(),
            stage,
            location: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn exists(&self, task: &TaskIdentity, stage: Stage) -> Result<bool> {
        task.validate()?;
        Ok(tokio::fs::try_exists(self.artifact_path(task, stage)).await?)
    }

    async fn read(&self, task: &TaskIdentity, stage: Stage) -> Result<Artifact> {
        task.validate()?;
        let path = self.artifact_path(task, stage);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AutoscribeError::NotFound {
                    task: task.clone(),
                    stage,
                });
            }
            Err(e) => return Err(e.into()),
        };

        // Undecodable bytes are corruption, not an I/O failure.
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| self.corrupt(task, stage, &path, e.to_string()))?;
        if envelope.story_id != task.story_id
            || envelope.test_id != task.test_id
            || envelope.stage != stage
        {
            return Err(self.corrupt(
                task,
                stage,
                &path,
                format!(
                    "envelope belongs to {}/{} stage {}",
                    envelope.story_id, envelope.test_id, envelope.stage
                ),
            ));
        }
        let payload = StagePayload::decode(stage, envelope.payload)
            .map_err(|e| self.corrupt(task, stage, &path, e.to_string()))?;

        Ok(Artifact {
            task: task.clone(),
            stage,
            payload,
            created_at: envelope.created_at,
        })
    }

    async fn write(
        &self,
        task: &TaskIdentity,
        stage: Stage,
        payload: StagePayload,
    ) -> Result<Artifact> {
        task.validate()?;
        ensure_owned(stage, &payload)?;
        payload.validate()?;

        let dir = self.task_dir(task);
        tokio::fs::create_dir_all(&dir).await?;

        let created_at = Utc::now();
        let envelope = Envelope {
            story_id: task.story_id.clone(),
            test_id: task.test_id.clone(),
            stage,
            created_at,
            payload: payload.to_value()?,
        };
        let json = serde_json::to_vec_pretty(&envelope)?;

        let path = self.artifact_path(task, stage);
        let tmp = dir.join(format!(
            ".{}_{}.{}.tmp",
            task.test_id,
            stage.checkpoint_name(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = write_then_rename(&tmp, &path, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(task = %task, stage = %stage, path = %path.display(), "Artifact written");

        Ok(Artifact {
            task: task.clone(),
            stage,
            payload,
            created_at,
        })
    }

    async fn clear(&self, task: &TaskIdentity) -> Result<()> {
        task.validate()?;
        let dir = self.task_dir(task);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
            tracing::info!(task = %task, "Checkpoints cleared");
        }
        Ok(())
    }
}

async fn write_then_rename(tmp: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, dest).await
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-process store; every write replaces the whole entry under a lock.
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<HashMap<(TaskIdentity, Stage), Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts across all tasks.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn exists(&self, task: &TaskIdentity, stage: Stage) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .await
            .contains_key(&(task.clone(), stage)))
    }

    async fn read(&self, task: &TaskIdentity, stage: Stage) -> Result<Artifact> {
        self.entries
            .read()
            .await
            .get(&(task.clone(), stage))
            .cloned()
            .ok_or_else(|| AutoscribeError::NotFound {
                task: task.clone(),
                stage,
            })
    }

    async fn write(
        &self,
        task: &TaskIdentity,
        stage: Stage,
        payload: StagePayload,
    ) -> Result<Artifact> {
        task.validate()?;
        ensure_owned(stage, &payload)?;
        payload.validate()?;
        let artifact = Artifact {
            task: task.clone(),
            stage,
            payload,
            created_at: Utc::now(),
        };
        self.entries
            .write()
            .await
            .insert((task.clone(), stage), artifact.clone());
        Ok(artifact)
    }

    async fn clear(&self, task: &TaskIdentity) -> Result<()> {
        self.entries.write().await.retain(|(t, _), _| t != task);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use autoscribe_types::{EmitManifest, PlanPayload, TargetElement};
    use std::sync::Arc;

    fn task() -> TaskIdentity {
        TaskIdentity::new("STORY-7", "REG_001").unwrap()
    }

    fn plan(keys: &[&str]) -> StagePayload {
        StagePayload::Plan(PlanPayload {
            title: Some("Login".into()),
            initial_url: None,
            steps: vec![],
            elements: keys
                .iter()
                .map(|k| TargetElement {
                    key_name: k.to_string(),
                    description: String::new(),
                })
                .collect(),
            outline: vec!["open login page".into()],
            page_objects: vec![],
        })
    }

    #[tokio::test]
    async fn path_is_derived_from_identity_and_stage() {
        let store = FsArtifactStore::new("/data");
        assert_eq!(
            store.artifact_path(&task(), Stage::DeriveSelectors),
            PathBuf::from("/data/STORY-7/REG_001/REG_001_selector_extractor_output.json")
        );
    }

    #[tokio::test]
    async fn write_then_read_returns_same_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        assert!(!store.exists(&task(), Stage::Plan).await.unwrap());
        let written = store.write(&task(), Stage::Plan, plan(&["loginButton"])).await.unwrap();
        assert!(store.exists(&task(), Stage::Plan).await.unwrap());

        let read = store.read(&task(), Stage::Plan).await.unwrap();
        assert_eq!(read.payload, written.payload);
        assert_eq!(read.stage, Stage::Plan);
        assert_eq!(read.task, task());
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let err = store.read(&task(), Stage::Trace).await.unwrap_err();
        assert!(matches!(err, AutoscribeError::NotFound { stage: Stage::Trace, .. }));
    }

    #[tokio::test]
    async fn garbage_file_is_corrupt_not_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let path = store.artifact_path(&task(), Stage::Plan);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(store.exists(&task(), Stage::Plan).await.unwrap());
        let err = store.read(&task(), Stage::Plan).await.unwrap_err();
        assert!(matches!(err, AutoscribeError::CorruptArtifact { .. }));
    }

    #[tokio::test]
    async fn non_utf8_file_is_corrupt_and_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let path = store.artifact_path(&task(), Stage::Plan);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).unwrap();

        let err = store.read(&task(), Stage::Plan).await.unwrap_err();
        assert!(matches!(
            err,
            AutoscribeError::CorruptArtifact {
                stage: Stage::Plan,
                ..
            }
        ));
        assert!(!err.kind().allows_task_retry());
    }

    #[tokio::test]
    async fn payload_failing_stage_schema_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let path = store.artifact_path(&task(), Stage::Emit);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let envelope = serde_json::json!({
            "storyId": "STORY-7",
            "testId": "REG_001",
            "stage": "emit",
            "createdAt": "2026-01-01T00:00:00Z",
            "payload": {"elements": []}
        });
        std::fs::write(&path, envelope.to_string()).unwrap();

        let err = store.read(&task(), Stage::Emit).await.unwrap_err();
        assert!(matches!(err, AutoscribeError::CorruptArtifact { stage: Stage::Emit, .. }));
    }

    #[tokio::test]
    async fn envelope_for_another_stage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write(&task(), Stage::Plan, plan(&["a"])).await.unwrap();
        std::fs::copy(
            store.artifact_path(&task(), Stage::Plan),
            store.artifact_path(&task(), Stage::Trace),
        )
        .unwrap();

        let err = store.read(&task(), Stage::Trace).await.unwrap_err();
        assert!(matches!(err, AutoscribeError::CorruptArtifact { .. }));
    }

    #[tokio::test]
    async fn write_rejects_payload_of_another_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let err = store
            .write(&task(), Stage::Trace, plan(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AutoscribeError::StageMismatch {
                stage: Stage::Trace,
                found: Stage::Plan
            }
        ));
        assert!(!store.exists(&task(), Stage::Trace).await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write(&task(), Stage::Plan, plan(&["a"])).await.unwrap();
        store.write(&task(), Stage::Plan, plan(&["b"])).await.unwrap();

        let read = store.read(&task(), Stage::Plan).await.unwrap();
        assert_eq!(read.payload.as_plan().unwrap().elements[0].key_name, "b");

        let names: Vec<String> = std::fs::read_dir(store.task_dir(&task()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["REG_001_planner_output.json".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_reader_never_sees_torn_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsArtifactStore::new(dir.path()));
        let small = plan(&["a"]);
        let keys: Vec<String> = (0..400).map(|i| format!("element{i}")).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let large = plan(&key_refs);
        store.write(&task(), Stage::Plan, small.clone()).await.unwrap();

        let writer = {
            let store = store.clone();
            let (small, large) = (small.clone(), large.clone());
            tokio::spawn(async move {
                for i in 0..40 {
                    let payload = if i % 2 == 0 { large.clone() } else { small.clone() };
                    store.write(&task(), Stage::Plan, payload).await.unwrap();
                }
            })
        };

        for _ in 0..200 {
            let read = store.read(&task(), Stage::Plan).await.unwrap();
            assert!(read.payload == small || read.payload == large);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn clear_removes_all_task_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write(&task(), Stage::Plan, plan(&["a"])).await.unwrap();
        store
            .write(
                &task(),
                Stage::Emit,
                StagePayload::Emit(EmitManifest {
                    files: vec![],
                    notes: None,
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            store.completed_stages(&task()).await.unwrap(),
            vec![Stage::Plan, Stage::Emit]
        );

        store.clear(&task()).await.unwrap();
        assert!(store.completed_stages(&task()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_behaves_like_fs_store() {
        let store = MemoryArtifactStore::new();
        assert!(store.is_empty().await);
        store.write(&task(), Stage::Plan, plan(&["a"])).await.unwrap();
        assert!(store.exists(&task(), Stage::Plan).await.unwrap());
        assert!(matches!(
            store.read(&task(), Stage::Trace).await,
            Err(AutoscribeError::NotFound { .. })
        ));
        assert!(matches!(
            store.write(&task(), Stage::Emit, plan(&["a"])).await,
            Err(AutoscribeError::StageMismatch { .. })
        ));
        store.clear(&task()).await.unwrap();
        assert_eq!(store.len().await, 0);
    }
}
