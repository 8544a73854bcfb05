use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use courier_common::internal;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::{fs, sync::Mutex};

use crate::{
    StoreError,
    error::Result,
    store::DeliveryLogStore,
    types::{DeliveryLogEntry, DeliveryLogId, NewDeliveryLogEntry, Transition},
};

/// File-based delivery log
///
/// Each entry is one bincode file named after its ULID: `{id}.bin`.
///
/// # Atomicity
/// Every write goes to `.tmp_{id}.bin` first and is then renamed over the
/// real file, so a crash never leaves a half-written row. Transitions on the
/// same row are serialised through a per-row lock; rows never share one.
#[derive(Debug, Clone)]
pub struct FileDeliveryLog {
    path: PathBuf,
    locks: Arc<DashMap<DeliveryLogId, Arc<Mutex<()>>>>,
}

impl Default for FileDeliveryLog {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/courier/deliveries"),
            locks: Arc::default(),
        }
    }
}

impl<'de> Deserialize<'de> for FileDeliveryLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Helper {
            path: PathBuf,
        }

        let helper = Helper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self::at(helper.path))
    }
}

impl FileDeliveryLog {
    fn at(path: PathBuf) -> Self {
        Self {
            path,
            locks: Arc::default(),
        }
    }

    /// Rejects `..` components, relative paths and system directories.
    fn validate_path(path: &Path) -> Result<()> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(StoreError::Validation(format!(
                "Store path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(StoreError::Validation(format!(
                "Store path must be absolute: {}",
                path.display()
            )));
        }

        for prefix in [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ] {
            if path.starts_with(prefix) {
                return Err(StoreError::Validation(format!(
                    "Store path cannot be in system directory {prefix}: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// Build a store rooted at `path`.
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;
        Ok(Self::at(path))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if needed and remove temporary files left by a
    /// crash mid-write.
    ///
    /// # Errors
    /// - If the path cannot be created
    /// - If the path exists but is not a directory
    pub fn init(&self) -> Result<()> {
        internal!("Initialising delivery log at {}", self.path.display());

        if !self.path.try_exists()? {
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(StoreError::Validation(format!(
                "Expected {} to be a directory",
                self.path.display()
            )));
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(".tmp_") {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned temporary files from the delivery log"
            );
        }

        Ok(())
    }

    async fn write(&self, entry: &DeliveryLogEntry) -> Result<()> {
        let filename = entry.id.filename();
        let temp = self.path.join(format!(".tmp_{filename}"));

        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())?;
        fs::write(&temp, &bytes).await?;
        fs::rename(&temp, self.path.join(filename)).await?;

        Ok(())
    }

    async fn read(&self, id: &DeliveryLogId) -> Result<DeliveryLogEntry> {
        let bytes = match fs::read(self.path.join(id.filename())).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        let (entry, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(entry)
    }

    async fn transition(
        &self,
        id: &DeliveryLogId,
        apply: impl FnOnce(&mut DeliveryLogEntry) -> Transition + Send,
    ) -> Result<Transition> {
        let lock = Arc::clone(&self.locks.entry(id.clone()).or_default());

        let result = {
            let _row = lock.lock().await;
            self.apply_locked(id, apply).await
        };

        drop(lock);
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn apply_locked(
        &self,
        id: &DeliveryLogId,
        apply: impl FnOnce(&mut DeliveryLogEntry) -> Transition + Send,
    ) -> Result<Transition> {
        let mut entry = self.read(id).await?;
        let transition = apply(&mut entry);

        if transition.applied() {
            self.write(&entry).await?;
        }

        Ok(transition)
    }

    async fn scan(
        &self,
        filter: impl Fn(&DeliveryLogEntry) -> bool + Send,
    ) -> Result<Vec<DeliveryLogEntry>> {
        let mut dir = fs::read_dir(&self.path).await?;
        let mut matching = Vec::new();

        while let Some(file) = dir.next_entry().await? {
            let filename = file.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(".tmp_") {
                continue;
            }

            let Some(id) = DeliveryLogId::from_filename(&filename) else {
                continue;
            };

            match self.read(&id).await {
                Ok(entry) if filter(&entry) => matching.push(entry),
                Ok(_) => {}
                Err(err) => {
                    internal!(level = WARN, "Skipping unreadable delivery log entry {id}: {err}");
                }
            }
        }

        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(matching)
    }
}

#[async_trait]
impl DeliveryLogStore for FileDeliveryLog {
    #[tracing::instrument(level = "debug", skip_all, fields(tenant = %entry.tenant_id))]
    async fn create(&self, entry: NewDeliveryLogEntry) -> Result<DeliveryLogId> {
        let id = DeliveryLogId::generate();

        if fs::try_exists(self.path.join(id.filename())).await? {
            return Err(StoreError::Internal(format!("ULID collision detected: {id}")));
        }

        self.write(&DeliveryLogEntry::pending(id.clone(), entry))
            .await?;

        internal!(level = DEBUG, "Created delivery log entry {id}");
        Ok(id)
    }

    #[tracing::instrument(level = "debug", skip(self, provider_message_id), fields(id = %id))]
    async fn mark_sent(
        &self,
        id: &DeliveryLogId,
        provider_message_id: &str,
    ) -> Result<Transition> {
        self.transition(id, |entry| entry.mark_sent(provider_message_id))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, error_detail), fields(id = %id))]
    async fn mark_failed(&self, id: &DeliveryLogId, error_detail: &str) -> Result<Transition> {
        self.transition(id, |entry| entry.mark_failed(error_detail))
            .await
    }

    async fn get(&self, id: &DeliveryLogId) -> Result<DeliveryLogEntry> {
        self.read(id).await
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<DeliveryLogEntry>> {
        self.scan(|entry| entry.tenant_id == tenant_id).await
    }

    async fn list_by_campaign(
        &self,
        tenant_id: &str,
        campaign_id: &str,
    ) -> Result<Vec<DeliveryLogEntry>> {
        self.scan(|entry| {
            entry.tenant_id == tenant_id && entry.campaign_id.as_deref() == Some(campaign_id)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::DeliveryStatus;

    fn store() -> (tempfile::TempDir, FileDeliveryLog) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileDeliveryLog::new(dir.path()).expect("Temp dir should be a valid path");
        store.init().expect("Failed to init");
        (dir, store)
    }

    fn draft(campaign: Option<&str>, recipient: &str) -> NewDeliveryLogEntry {
        NewDeliveryLogEntry {
            tenant_id: String::from("acme"),
            campaign_id: campaign.map(ToString::to_string),
            recipient: recipient.to_string(),
            subject: String::from("Spring sale"),
            text_body: String::from("20% off"),
            html_body: String::from("<b>20% off</b>"),
        }
    }

    #[tokio::test]
    async fn entries_survive_reopening() {
        let (dir, store) = store();
        let id = store.create(draft(None, "A@Good.com")).await.unwrap();
        store.mark_sent(&id, "<x@acme.test>").await.unwrap();

        let reopened = FileDeliveryLog::new(dir.path()).unwrap();
        let entry = reopened.get(&id).await.unwrap();

        assert_eq!(entry.recipient, "a@good.com");
        assert_eq!(entry.status, DeliveryStatus::Sent);
        assert_eq!(entry.provider_message_id.as_deref(), Some("<x@acme.test>"));
        assert_eq!(entry.subject, "Spring sale");
    }

    #[tokio::test]
    async fn second_completion_is_a_no_op() {
        let (_dir, store) = store();
        let id = store.create(draft(None, "a@good.com")).await.unwrap();

        assert!(store.mark_failed(&id, "timed out").await.unwrap().applied());
        assert_eq!(
            store.mark_sent(&id, "<x@acme.test>").await.unwrap(),
            Transition::AlreadyTerminal(DeliveryStatus::Failed)
        );

        let entry = store.get(&id).await.unwrap();
        assert_eq!(entry.status, DeliveryStatus::Failed);
        assert_eq!(entry.error_detail.as_deref(), Some("timed out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_apply_once() {
        let (_dir, store) = store();
        let id = store.create(draft(None, "a@good.com")).await.unwrap();

        let mut handles = vec![];
        for i in 0..16 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.mark_failed(&id, &format!("failure {i}")).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().applied() {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn listing_skips_foreign_files() {
        let (dir, store) = store();
        store.create(draft(Some("spring"), "a@good.com")).await.unwrap();
        store.create(draft(Some("spring"), "b@good.com")).await.unwrap();
        store.create(draft(Some("autumn"), "c@good.com")).await.unwrap();

        std::fs::write(dir.path().join("README.txt"), "not an entry").unwrap();
        std::fs::write(dir.path().join("01ARZ3NDEKTSV4RRFFQ69G5FAV.bin"), "garbage").unwrap();

        assert_eq!(store.list_by_tenant("acme").await.unwrap().len(), 3);
        assert_eq!(store.list_by_campaign("acme", "spring").await.unwrap().len(), 2);
        assert!(store.list_by_campaign("globex", "spring").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let (_dir, store) = store();
        let id = DeliveryLogId::generate();

        assert!(store.get(&id).await.unwrap_err().is_not_found());
        assert!(store.mark_failed(&id, "x").await.unwrap_err().is_not_found());
        assert!(store.locks.is_empty());
    }

    #[test]
    fn init_removes_temporary_files() {
        let (dir, store) = store();
        std::fs::write(dir.path().join(".tmp_01ARZ3NDEKTSV4RRFFQ69G5FAV.bin"), "partial").unwrap();

        store.init().unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
