use crate::input::Seed;
use crate::message::{MessageLog, bincode_config};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Seed I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Seed {path:?} is not a valid JSON message log: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Seed {path:?} is not a valid binary message log: {source}")]
    Bincode {
        path: PathBuf,
        #[source]
        source: bincode::error::DecodeError,
    },
    #[error("Failed to encode message log for {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: bincode::error::EncodeError,
    },
    #[error("Seed path {0:?} is neither a file nor a directory")]
    NotFound(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SeedError + '_ {
    move |source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Reads one message log. `.json` files hold a JSON array of records, any
/// other file the bincode encoding of a [`MessageLog`].
pub fn load_seed_log(path: &Path) -> Result<MessageLog, SeedError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    if is_json(path) {
        serde_json::from_slice(&bytes).map_err(|source| SeedError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        bincode::decode_from_slice(&bytes, bincode_config())
            .map(|(log, _)| log)
            .map_err(|source| SeedError::Bincode {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Writes a message log in the format implied by the file extension.
pub fn write_seed_log(path: &Path, log: &MessageLog) -> Result<(), SeedError> {
    let bytes = if is_json(path) {
        serde_json::to_vec_pretty(log).map_err(|source| SeedError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        bincode::encode_to_vec(log, bincode_config()).map_err(|source| SeedError::Encode {
            path: path.to_path_buf(),
            source,
        })?
    };
    fs::write(path, bytes).map_err(io_error(path))
}

/// Builds the seed pool from files and directories.
///
/// Directories are read one level deep and their entries loaded in file-name
/// order; hidden files (leading `.`) and subdirectories are skipped. Each
/// seed's reference is the path it was read from.
pub fn load_seed_pool(paths: &[PathBuf]) -> Result<Vec<Arc<Seed<MessageLog>>>, SeedError> {
    let mut pool = Vec::new();
    for path in paths {
        if path.is_file() {
            pool.push(load_seed(path)?);
        } else if path.is_dir() {
            let mut entries = Vec::new();
            for entry in fs::read_dir(path).map_err(io_error(path))? {
                let entry = entry.map_err(io_error(path))?;
                let file_path = entry.path();
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !hidden && file_path.is_file() {
                    entries.push(file_path);
                }
            }
            entries.sort();
            debug!("Loading {} seed(s) from {:?}", entries.len(), path);
            for file_path in &entries {
                pool.push(load_seed(file_path)?);
            }
        } else {
            return Err(SeedError::NotFound(path.clone()));
        }
    }
    info!("Loaded {} seed(s)", pool.len());
    Ok(pool)
}

fn load_seed(path: &Path) -> Result<Arc<Seed<MessageLog>>, SeedError> {
    let log = load_seed_log(path)?;
    debug!("Seed {:?}: {} message(s)", path, log.len());
    Ok(Arc::new(Seed::new(path.display().to_string(), log)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::test_utils::labelled_log;
    use tempfile::tempdir;

    #[test]
    fn json_and_binary_seeds_load_back() {
        let dir = tempdir().unwrap();
        let log = labelled_log(&["A", "B"]);
        let json_path = dir.path().join("one.json");
        let bin_path = dir.path().join("two.log");
        write_seed_log(&json_path, &log).unwrap();
        write_seed_log(&bin_path, &log).unwrap();

        assert_eq!(load_seed_log(&json_path).unwrap(), log);
        assert_eq!(load_seed_log(&bin_path).unwrap(), log);
    }

    #[test]
    fn directory_pool_is_sorted_and_skips_hidden_files() {
        let dir = tempdir().unwrap();
        write_seed_log(&dir.path().join("b.json"), &labelled_log(&["B"])).unwrap();
        write_seed_log(&dir.path().join("a.json"), &labelled_log(&["A"])).unwrap();
        fs::write(dir.path().join(".hidden.json"), b"not a log").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let pool = load_seed_pool(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool[0].reference().ends_with("a.json"));
        assert!(pool[1].reference().ends_with("b.json"));
        assert_eq!(pool[0].value(), &labelled_log(&["A"]));
    }

    #[test]
    fn malformed_json_seed_reports_its_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{ nope").unwrap();
        match load_seed_pool(&[path.clone()]) {
            Err(SeedError::Json { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected JSON error, got {other:?}"),
        }
    }

    #[test]
    fn missing_seed_path_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(matches!(
            load_seed_pool(&[missing]),
            Err(SeedError::NotFound(_))
        ));
    }
}
