//! Disk spool backing the spill-to-disk overflow policy.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;

use super::task::PublishTask;

/// One JSON file per task, named by a monotonically increasing sequence so
/// lexicographic order is arrival order. The index is rebuilt by scanning the
/// directory on open, which doubles as crash recovery.
pub(crate) struct SpillDir {
    dir: PathBuf,
    next_seq: u64,
    per_entity: HashMap<String, VecDeque<u64>>,
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl SpillDir {
    pub(crate) fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut found: Vec<(u64, String)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let seq = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(seq) => seq,
                None => continue,
            };
            let task: PublishTask =
                serde_json::from_slice(&fs::read(&path)?).map_err(invalid_data)?;
            found.push((seq, task.event.entity_id));
        }
        found.sort_by_key(|(seq, _)| *seq);

        let next_seq = found.last().map_or(0, |(seq, _)| seq + 1);
        let mut per_entity: HashMap<String, VecDeque<u64>> = HashMap::new();
        for (seq, entity) in found {
            per_entity.entry(entity).or_default().push_back(seq);
        }

        Ok(Self {
            dir,
            next_seq,
            per_entity,
        })
    }

    pub(crate) fn total(&self) -> usize {
        self.per_entity.values().map(|q| q.len()).sum()
    }

    pub(crate) fn has(&self, entity: &str) -> bool {
        self.per_entity.contains_key(entity)
    }

    pub(crate) fn entities(&self) -> Vec<String> {
        self.per_entity.keys().cloned().collect()
    }

    pub(crate) fn write(&mut self, task: &PublishTask) -> io::Result<()> {
        let seq = self.next_seq;
        let bytes = serde_json::to_vec(task).map_err(invalid_data)?;
        fs::write(self.path_for(seq), bytes)?;
        self.next_seq += 1;
        self.per_entity
            .entry(task.event.entity_id.clone())
            .or_default()
            .push_back(seq);
        Ok(())
    }

    /// Load and remove the oldest spilled task for `entity`.
    pub(crate) fn pop_oldest_for(&mut self, entity: &str) -> io::Result<Option<PublishTask>> {
        let seq = match self.per_entity.get(entity).and_then(|q| q.front()) {
            Some(seq) => *seq,
            None => return Ok(None),
        };
        let path = self.path_for(seq);
        let task: PublishTask = serde_json::from_slice(&fs::read(&path)?).map_err(invalid_data)?;
        fs::remove_file(&path)?;
        if let Some(queue) = self.per_entity.get_mut(entity) {
            queue.pop_front();
            if queue.is_empty() {
                self.per_entity.remove(entity);
            }
        }
        Ok(Some(task))
    }

    fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{:016}.json", seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DomainEvent, EventKind};
    use crate::routing::{RoutingDescriptor, DEFAULT_EXCHANGE};
    use serde_json::json;

    fn task(entity: &str, sequence: u64) -> PublishTask {
        let event = DomainEvent::new(EventKind::TransitRecorded, entity, sequence, json!({}));
        let routing = RoutingDescriptor::for_kind(event.kind, DEFAULT_EXCHANGE);
        PublishTask::new(event, routing, b"{}".to_vec())
    }

    #[test]
    fn writes_and_pops_in_fifo_order_per_entity() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillDir::open(dir.path()).unwrap();

        spill.write(&task("a", 1)).unwrap();
        spill.write(&task("b", 1)).unwrap();
        spill.write(&task("a", 2)).unwrap();
        assert_eq!(spill.total(), 3);
        assert!(spill.has("a"));

        let first = spill.pop_oldest_for("a").unwrap().unwrap();
        assert_eq!(first.event.sequence, 1);
        let second = spill.pop_oldest_for("a").unwrap().unwrap();
        assert_eq!(second.event.sequence, 2);
        assert!(!spill.has("a"));
        assert!(spill.pop_oldest_for("a").unwrap().is_none());
        assert_eq!(spill.total(), 1);
    }

    #[test]
    fn reopening_recovers_the_spool() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut spill = SpillDir::open(dir.path()).unwrap();
            spill.write(&task("a", 1)).unwrap();
            spill.write(&task("a", 2)).unwrap();
        }

        let mut spill = SpillDir::open(dir.path()).unwrap();
        assert_eq!(spill.total(), 2);
        let first = spill.pop_oldest_for("a").unwrap().unwrap();
        assert_eq!(first.event.sequence, 1);
    }

    #[test]
    fn foreign_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.txt"), b"not a task").unwrap();

        let mut spill = SpillDir::open(dir.path()).unwrap();
        assert_eq!(spill.total(), 0);
        spill.write(&task("a", 1)).unwrap();
        assert_eq!(spill.total(), 1);
    }
}
