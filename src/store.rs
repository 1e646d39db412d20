//! Mission persistence.
//!
//! Writes are at-least-once. `append_event` is idempotent on the pair
//! (mission id, event sequence): replaying an event that was already stored
//! is a no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::evidence::Event;
use crate::model::{Mission, MissionId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("mission {0} not found")]
    NotFound(MissionId),

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait MissionStore: Send + Sync {
    async fn create(&self, mission: &Mission) -> Result<(), StoreError>;

    async fn update(&self, mission: &Mission) -> Result<(), StoreError>;

    async fn append_event(&self, mission_id: MissionId, event: &Event) -> Result<(), StoreError>;

    async fn load(&self, mission_id: MissionId) -> Result<Option<Mission>, StoreError>;

    async fn events(&self, mission_id: MissionId) -> Result<Vec<Event>, StoreError>;

    /// Most recently submitted first.
    async fn list(&self, limit: usize) -> Result<Vec<Mission>, StoreError>;
}

#[derive(Debug, Default)]
struct Record {
    mission: Option<Mission>,
    events: Vec<Event>,
}

/// In-process store, used by tests and as the default for embedders.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<MissionId, Record>>,
}

#[async_trait]
impl MissionStore for MemoryStore {
    async fn create(&self, mission: &Mission) -> Result<(), StoreError> {
        self.records.lock().await.entry(mission.id).or_default().mission = Some(mission.clone());
        Ok(())
    }

    async fn update(&self, mission: &Mission) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&mission.id).ok_or(StoreError::NotFound(mission.id))?;
        record.mission = Some(mission.clone());
        Ok(())
    }

    async fn append_event(&self, mission_id: MissionId, event: &Event) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records.entry(mission_id).or_default();
        if record.events.last().is_some_and(|last| last.seq >= event.seq) {
            return Ok(());
        }
        record.events.push(event.clone());
        Ok(())
    }

    async fn load(&self, mission_id: MissionId) -> Result<Option<Mission>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .get(&mission_id)
            .and_then(|r| r.mission.clone()))
    }

    async fn events(&self, mission_id: MissionId) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .get(&mission_id)
            .map(|r| r.events.clone())
            .unwrap_or_default())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Mission>, StoreError> {
        let records = self.records.lock().await;
        let mut missions: Vec<Mission> = records.values().filter_map(|r| r.mission.clone()).collect();
        sort_newest_first(&mut missions);
        missions.truncate(limit);
        Ok(missions)
    }
}

/// JSON documents on disk: `<dir>/missions/<id>.json` holds the latest
/// snapshot and `<dir>/missions/<id>.events.jsonl` the event log.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    /// Highest stored sequence per mission, loaded lazily. The outer lock is
    /// held only to find the mission's slot, never across I/O.
    last_seq: std::sync::Mutex<HashMap<MissionId, Arc<Mutex<Option<u64>>>>>,
}

impl FileStore {
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        let dir = dir.join("missions");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            last_seq: std::sync::Mutex::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn seq_slot(&self, id: MissionId) -> Arc<Mutex<Option<u64>>> {
        let mut slots = self.last_seq.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(id).or_default())
    }

    fn mission_path(&self, id: MissionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn events_path(&self, id: MissionId) -> PathBuf {
        self.dir.join(format!("{id}.events.jsonl"))
    }

    async fn write_mission(&self, mission: &Mission) -> Result<(), StoreError> {
        let path = self.mission_path(mission.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(mission)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_events(&self, id: MissionId) -> Result<Vec<Event>, StoreError> {
        let contents = match tokio::fs::read_to_string(self.events_path(id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                // A torn final line from a crash mid-append.
                Err(e) => tracing::warn!(mission = %id, error = %e, "skipping unreadable event line"),
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl MissionStore for FileStore {
    async fn create(&self, mission: &Mission) -> Result<(), StoreError> {
        self.write_mission(mission).await
    }

    async fn update(&self, mission: &Mission) -> Result<(), StoreError> {
        if !tokio::fs::try_exists(self.mission_path(mission.id)).await? {
            return Err(StoreError::NotFound(mission.id));
        }
        self.write_mission(mission).await
    }

    async fn append_event(&self, mission_id: MissionId, event: &Event) -> Result<(), StoreError> {
        let slot = self.seq_slot(mission_id);
        let mut last_seq = slot.lock().await;
        let last = match *last_seq {
            Some(seq) => seq,
            None => self
                .read_events(mission_id)
                .await?
                .last()
                .map_or(0, |e| e.seq),
        };
        *last_seq = Some(last);
        if event.seq <= last {
            return Ok(());
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(mission_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        *last_seq = Some(event.seq);
        Ok(())
    }

    async fn load(&self, mission_id: MissionId) -> Result<Option<Mission>, StoreError> {
        match tokio::fs::read(self.mission_path(mission_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn events(&self, mission_id: MissionId) -> Result<Vec<Event>, StoreError> {
        self.read_events(mission_id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Mission>, StoreError> {
        let mut missions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json") && !n.ends_with(".events.json"));
            if !is_snapshot {
                continue;
            }
            match tokio::fs::read(&path).await.map(|b| serde_json::from_slice::<Mission>(&b)) {
                Ok(Ok(mission)) => missions.push(mission),
                Ok(Err(e)) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable mission"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable mission"),
            }
        }
        sort_newest_first(&mut missions);
        missions.truncate(limit);
        Ok(missions)
    }
}

fn sort_newest_first(missions: &mut [Mission]) {
    missions.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::model::SubmitOptions;
    use crate::state::MissionStatus;

    fn mission(minutes_ago: i64) -> Mission {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        Mission::new("build a thing", 3, at, at + Duration::minutes(15), SubmitOptions::default())
    }

    fn event(seq: u64) -> Event {
        Event {
            seq,
            at: Utc::now(),
            phase: MissionStatus::Pending,
            detail: format!("event {seq}"),
            evidence: None,
        }
    }

    #[tokio::test]
    async fn memory_store_append_is_idempotent() {
        let store = MemoryStore::default();
        let m = mission(0);
        store.create(&m).await.unwrap();
        store.append_event(m.id, &event(1)).await.unwrap();
        store.append_event(m.id, &event(2)).await.unwrap();
        store.append_event(m.id, &event(2)).await.unwrap();
        store.append_event(m.id, &event(1)).await.unwrap();
        let seqs: Vec<u64> = store.events(m.id).await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn memory_store_update_requires_create() {
        let store = MemoryStore::default();
        assert!(matches!(store.update(&mission(0)).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let store = MemoryStore::default();
        let old = mission(30);
        let mid = mission(20);
        let new = mission(10);
        for m in [&mid, &old, &new] {
            store.create(m).await.unwrap();
        }
        let listed = store.list(2).await.unwrap();
        assert_eq!(listed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![new.id, mid.id]);
    }

    #[tokio::test]
    async fn file_store_round_trips_missions_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let mut m = mission(0);
        store.create(&m).await.unwrap();
        m.status = MissionStatus::Architecting;
        store.update(&m).await.unwrap();
        store.append_event(m.id, &event(1)).await.unwrap();
        store.append_event(m.id, &event(2)).await.unwrap();

        let loaded = store.load(m.id).await.unwrap().unwrap();
        assert_eq!(loaded, m);
        assert_eq!(store.events(m.id).await.unwrap().len(), 2);
        assert_eq!(store.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_dedups_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let m = mission(0);
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.create(&m).await.unwrap();
            store.append_event(m.id, &event(1)).await.unwrap();
        }
        let store = FileStore::open(dir.path()).await.unwrap();
        store.append_event(m.id, &event(1)).await.unwrap();
        store.append_event(m.id, &event(2)).await.unwrap();
        let seqs: Vec<u64> = store.events(m.id).await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn file_store_appends_for_one_mission_do_not_wait_on_another() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let busy = mission(0);
        let other = mission(0);

        let slot = store.seq_slot(busy.id);
        let held = slot.lock().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), store.append_event(other.id, &event(1)))
            .await
            .expect("append for another mission blocked")
            .unwrap();

        let blocked = {
            let store = Arc::clone(&store);
            let id = busy.id;
            tokio::spawn(async move { store.append_event(id, &event(1)).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        drop(held);
        blocked.await.unwrap().unwrap();
        assert_eq!(store.events(busy.id).await.unwrap().len(), 1);
        assert_eq!(store.events(other.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_concurrent_appends_stay_ordered_per_mission() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let missions = [mission(0), mission(0)];
        let mut tasks = Vec::new();
        for m in &missions {
            let store = Arc::clone(&store);
            let id = m.id;
            tasks.push(tokio::spawn(async move {
                for seq in 1..=20 {
                    store.append_event(id, &event(seq)).await.unwrap();
                    store.append_event(id, &event(seq)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        for m in &missions {
            let seqs: Vec<u64> = store.events(m.id).await.unwrap().iter().map(|e| e.seq).collect();
            assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn file_store_missing_mission_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.load(MissionId::new()).await.unwrap().is_none());
        assert!(store.events(MissionId::new()).await.unwrap().is_empty());
    }
}
