use crate::input::Input;
use crate::mutation::{Mutation, MutationRecord, to_record};
use crate::oracle::{OutcomeKind, Verdict};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const RECORD_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record store I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Record store path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What gets persisted for a crash or timeout: where the input started and
/// how it was derived. The materialized payload is never stored; replaying
/// the chain over the same seed reproduces it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InterestingInputRecord {
    /// md5 over the seed reference and the serialized chain.
    pub fingerprint: String,
    pub outcome: OutcomeKind,
    pub seed_reference: String,
    pub mutation_chain: Vec<MutationRecord>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub iteration: u64,
}

impl InterestingInputRecord {
    pub fn from_input<T, M>(
        input: &Input<T, M>,
        verdict: &Verdict,
        app: &str,
        iteration: u64,
    ) -> Result<Self, StoreError>
    where
        M: Mutation<T> + Serialize,
    {
        let mutation_chain = input
            .mutations()
            .into_iter()
            .map(to_record)
            .collect::<Result<Vec<_>, _>>()?;
        let seed_reference = input.seed().reference().to_string();
        Ok(Self {
            fingerprint: fingerprint(&seed_reference, &mutation_chain)?,
            outcome: verdict.kind,
            seed_reference,
            mutation_chain,
            detail: verdict.detail.clone(),
            app: app.to_string(),
            iteration,
        })
    }

    /// File stem and deduplication key: outcome plus fingerprint.
    pub fn key(&self) -> String {
        format!("{}-{}", self.outcome, self.fingerprint)
    }
}

pub fn fingerprint(seed_reference: &str, chain: &[MutationRecord]) -> Result<String, StoreError> {
    let mut bytes = seed_reference.as_bytes().to_vec();
    bytes.push(b'\n');
    bytes.extend(serde_json::to_vec(chain)?);
    Ok(format!("{:x}", md5::compute(bytes)))
}

/// Reads one persisted record.
pub fn load_record(path: &Path) -> Result<InterestingInputRecord, StoreError> {
    let content = fs::read(path).map_err(io_error(path))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Append-only sink for interesting inputs. Appending an already-stored
/// record is not an error; it returns `Ok(false)`.
pub trait RecordStore: Send {
    fn append(&mut self, record: InterestingInputRecord) -> Result<bool, StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where records end up, for the session summary.
    fn location(&self) -> String;

    fn records(&self) -> Result<Vec<InterestingInputRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Vec<InterestingInputRecord>,
    keys: HashSet<String>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn append(&mut self, record: InterestingInputRecord) -> Result<bool, StoreError> {
        if !self.keys.insert(record.key()) {
            return Ok(false);
        }
        self.records.push(record);
        Ok(true)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn location(&self) -> String {
        "memory".to_string()
    }

    fn records(&self) -> Result<Vec<InterestingInputRecord>, StoreError> {
        Ok(self.records.clone())
    }
}

/// One pretty-printed JSON file per record, named `<outcome>-<fingerprint>.json`.
///
/// Records already in the directory are picked up on open, so a resumed
/// session does not write duplicates.
#[derive(Debug)]
pub struct OnDiskRecordStore {
    dir: PathBuf,
    keys: HashSet<String>,
}

impl OnDiskRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        } else if !dir.is_dir() {
            return Err(StoreError::NotADirectory(dir));
        }

        let mut keys = HashSet::new();
        for entry in fs::read_dir(&dir).map_err(io_error(&dir))? {
            let path = entry.map_err(io_error(&dir))?.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                if let Some(stem) = path.file_stem() {
                    keys.insert(stem.to_string_lossy().into_owned());
                }
            }
        }
        debug!("Record store {:?} holds {} record(s)", dir, keys.len());
        Ok(Self { dir, keys })
    }

    pub fn record_path(&self, record: &InterestingInputRecord) -> PathBuf {
        self.dir
            .join(record.key())
            .with_extension(RECORD_EXTENSION)
    }
}

impl RecordStore for OnDiskRecordStore {
    fn append(&mut self, record: InterestingInputRecord) -> Result<bool, StoreError> {
        let key = record.key();
        if self.keys.contains(&key) {
            return Ok(false);
        }
        let path = self.record_path(&record);
        let bytes = serde_json::to_vec_pretty(&record)?;

        // Written to a temporary sibling first so readers never see a partial record.
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_error(&self.dir))?;
        staged.write_all(&bytes).map_err(io_error(staged.path()))?;
        staged
            .persist(&path)
            .map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e.error,
            })?;

        self.keys.insert(key);
        Ok(true)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    fn records(&self) -> Result<Vec<InterestingInputRecord>, StoreError> {
        let mut keys: Vec<&String> = self.keys.iter().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| load_record(&self.dir.join(key).with_extension(RECORD_EXTENSION)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Seed;
    use crate::message::MessageLog;
    use crate::message::test_utils::labelled_log;
    use crate::mutation::LogMutation;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn crashing_input() -> Input<MessageLog, LogMutation> {
        Input::new(Arc::new(Seed::new("seeds/three.json", labelled_log(&["A", "B", "C"]))))
            .mutate(LogMutation::DropMessage { index: 1 })
            .mutate(LogMutation::DropMessage { index: 0 })
    }

    fn record() -> InterestingInputRecord {
        InterestingInputRecord::from_input(
            &crashing_input(),
            &Verdict::crash("exited with code 1"),
            "talker",
            7,
        )
        .unwrap()
    }

    #[test]
    fn record_keeps_chain_not_value() {
        let record = record();
        assert_eq!(record.seed_reference, "seeds/three.json");
        assert_eq!(record.mutation_chain.len(), 2);
        assert_eq!(record.mutation_chain[0].name, "drop-message");
        assert_eq!(record.mutation_chain[0].params, serde_json::json!({ "index": 1 }));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "crash");
        assert!(json.get("value").is_none());
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn fingerprint_depends_on_seed_and_chain() {
        let chain = record().mutation_chain;
        let a = fingerprint("seeds/a.json", &chain).unwrap();
        assert_eq!(a, fingerprint("seeds/a.json", &chain).unwrap());
        assert_ne!(a, fingerprint("seeds/b.json", &chain).unwrap());
        assert_ne!(a, fingerprint("seeds/a.json", &chain[..1]).unwrap());
    }

    #[test]
    fn in_memory_store_deduplicates() {
        let mut store = InMemoryRecordStore::new();
        assert!(store.append(record()).unwrap());
        assert!(!store.append(record()).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn on_disk_store_writes_named_files_and_reloads_them() {
        let dir = tempdir().unwrap();
        let mut store = OnDiskRecordStore::new(dir.path().join("out")).unwrap();
        let record = record();
        assert!(store.append(record.clone()).unwrap());

        let path = store.record_path(&record);
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("crash-{}.json", record.fingerprint)
        );
        assert_eq!(load_record(&path).unwrap(), record);

        let mut reopened = OnDiskRecordStore::new(dir.path().join("out")).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(!reopened.append(record.clone()).unwrap());
        assert_eq!(reopened.records().unwrap(), vec![record]);
    }

    #[test]
    fn on_disk_store_rejects_file_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("taken");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            OnDiskRecordStore::new(&file),
            Err(StoreError::NotADirectory(_))
        ));
    }
}
