use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::{SourceError, TaskSet, TaskSource};
use crate::checkpoint::RESERVED_COLUMNS;
use crate::model::{FieldMap, WorkItem};

/// Work items from a CSV file. The id and query columns are configurable;
/// every other column is carried as context.
#[derive(Debug, Clone)]
pub struct CsvSource {
    pub path: PathBuf,
    pub id_column: String,
    pub query_column: String,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>, id_column: &str, query_column: &str) -> Self {
        Self {
            path: path.into(),
            id_column: id_column.to_string(),
            query_column: query_column.to_string(),
        }
    }

    fn read(&self) -> Result<TaskSet, SourceError> {
        let csv_err = |source| SourceError::Csv {
            path: self.path.clone(),
            source,
        };
        let file = File::open(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(file);

        let headers = rdr.headers().map_err(csv_err)?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| SourceError::MissingColumn {
                    path: self.path.clone(),
                    column: name.to_string(),
                })
        };
        let id_idx = column(&self.id_column)?;
        let query_idx = column(&self.query_column)?;

        let context_keys: Vec<String> = headers
            .iter()
            .map(|h| {
                if RESERVED_COLUMNS.contains(&h) {
                    format!("input_{}", h)
                } else {
                    h.to_string()
                }
            })
            .collect();

        let mut set = TaskSet::default();
        let mut seen = HashSet::new();
        for (line, record) in rdr.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping unreadable row {} in {}: {}", line + 2, self.path.display(), e);
                    set.dropped_invalid += 1;
                    continue;
                }
            };
            let id = record.get(id_idx).unwrap_or_default();
            let query = record.get(query_idx).unwrap_or_default();
            if id.is_empty() || query.is_empty() {
                set.dropped_invalid += 1;
                continue;
            }
            if !seen.insert(id.to_string()) {
                set.dropped_duplicate += 1;
                continue;
            }

            let context: FieldMap = record
                .iter()
                .enumerate()
                .filter(|(i, v)| *i != id_idx && *i != query_idx && !v.is_empty())
                .filter_map(|(i, v)| Some((context_keys.get(i)?.clone(), v.to_string())))
                .collect();
            set.items.push(WorkItem {
                id: id.to_string(),
                query: query.to_string(),
                context,
            });
        }
        Ok(set)
    }
}

#[async_trait]
impl TaskSource for CsvSource {
    async fn load(&self) -> Result<TaskSet, SourceError> {
        let set = self.read()?;
        info!(
            "Loaded {} tasks from {} ({} invalid, {} duplicate rows dropped)",
            set.items.len(),
            self.path.display(),
            set.dropped_invalid,
            set.dropped_duplicate
        );
        Ok(set)
    }
}

/// Write `items` as a task file readable by [`CsvSource`]. Context keys
/// become extra columns after the id and query columns.
pub fn write_tasks(
    path: &Path,
    items: &[WorkItem],
    id_column: &str,
    query_column: &str,
) -> Result<(), SourceError> {
    let io_err = |source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let csv_err = |source| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let columns: BTreeSet<&str> = items
        .iter()
        .flat_map(|item| item.context.keys().map(String::as_str))
        .filter(|key| *key != id_column && *key != query_column)
        .collect();

    let tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(tmp));
    wtr.write_record([id_column, query_column].into_iter().chain(columns.iter().copied()))
        .map_err(csv_err)?;
    for item in items {
        let mut record = vec![item.id.as_str(), item.query.as_str()];
        record.extend(
            columns
                .iter()
                .map(|c| item.context.get(*c).map(String::as_str).unwrap_or_default()),
        );
        wtr.write_record(&record).map_err(csv_err)?;
    }

    let buf = wtr
        .into_inner()
        .map_err(|e| io_err(io::Error::other(e.to_string())))?;
    let tmp = buf.into_inner().map_err(|e| io_err(e.into_error()))?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
