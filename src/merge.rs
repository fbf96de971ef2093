//! Combine chunk checkpoints into the final deduplicated dataset.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointError, CheckpointRow, CheckpointStore};
use crate::model::{ChunkId, OutcomeTag};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MergeSummary {
    pub chunks: usize,
    pub incomplete_chunks: usize,
    pub total: usize,
    pub duplicates: usize,
    pub counts: BTreeMap<OutcomeTag, usize>,
}

impl MergeSummary {
    pub fn count(&self, tag: OutcomeTag) -> usize {
        self.counts.get(&tag).copied().unwrap_or(0)
    }

    /// Share of records that were fully extracted.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(OutcomeTag::Success) as f64 / self.total as f64
    }
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Chunks:       {} ({} incomplete)",
            self.chunks, self.incomplete_chunks
        )?;
        writeln!(
            f,
            "Records:      {} ({} duplicates dropped)",
            self.total, self.duplicates
        )?;
        for tag in OutcomeTag::ALL {
            writeln!(f, "  {:<12}{:>6}", tag.as_str(), self.count(tag))?;
        }
        write!(f, "Success rate: {:.1}%", self.success_rate() * 100.0)
    }
}

/// Records selected for the final dataset, in output order.
pub struct Merged {
    pub records: Vec<CheckpointRow>,
    pub summary: MergeSummary,
}

/// Normalized natural key for `row`. Falls back to the item id when none of
/// the key fields has a value.
pub fn natural_key(row: &CheckpointRow, key_fields: &[String]) -> String {
    let fields = row.fields();
    let parts: Vec<String> = key_fields
        .iter()
        .map(|name| {
            fields
                .get(name)
                .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
                .unwrap_or_default()
        })
        .collect();
    if parts.iter().all(String::is_empty) {
        return format!("id:{}", row.item.id);
    }
    parts.join("|")
}

/// Read every checkpoint and select one record per natural key.
pub fn collect(store: &CheckpointStore, key_fields: &[String]) -> Result<Merged, MergeError> {
    let ids: Vec<ChunkId> = store.list()?;
    let checkpoints = ids
        .par_iter()
        .map(|id| store.read(*id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut summary = MergeSummary {
        chunks: checkpoints.len(),
        incomplete_chunks: checkpoints.iter().filter(|c| !c.complete).count(),
        ..MergeSummary::default()
    };

    // Best outcome per item id, keeping the first-seen position.
    let mut best: Vec<CheckpointRow> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for row in checkpoints.into_iter().flat_map(|c| c.rows) {
        match by_id.get(&row.item.id) {
            Some(&i) => {
                if row.outcome.tag().rank() > best[i].outcome.tag().rank() {
                    best[i] = row;
                }
            }
            None => {
                by_id.insert(row.item.id.clone(), best.len());
                best.push(row);
            }
        }
    }

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(best.len());
    for row in best {
        let key = natural_key(&row, key_fields);
        if !seen.insert(key) {
            debug!(item = %row.item.id, "Dropping duplicate record");
            summary.duplicates += 1;
            continue;
        }
        *summary.counts.entry(row.outcome.tag()).or_default() += 1;
        records.push(row);
    }
    summary.total = records.len();

    Ok(Merged { records, summary })
}

/// Merge the store into `output`, replacing it atomically.
pub fn merge(
    store: &CheckpointStore,
    key_fields: &[String],
    output: &Path,
) -> Result<MergeSummary, MergeError> {
    let merged = collect(store, key_fields)?;
    write_dataset(output, &merged.records)?;
    info!(
        "Merged {} records into {} ({} duplicates dropped)",
        merged.summary.total,
        output.display(),
        merged.summary.duplicates
    );
    Ok(merged.summary)
}

fn write_dataset(output: &Path, records: &[CheckpointRow]) -> Result<(), MergeError> {
    let io_err = |source| MergeError::Io {
        path: output.to_path_buf(),
        source,
    };
    let csv_err = |source| MergeError::Csv {
        path: output.to_path_buf(),
        source,
    };

    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_err)?;

    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|row| row.fields().keys().map(String::as_str))
        .collect();

    let tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(tmp));
    wtr.write_record(
        ["item_id", "status", "error_detail"]
            .into_iter()
            .chain(columns.iter().copied()),
    )
    .map_err(csv_err)?;

    for row in records {
        let detail = match (row.outcome.cause(), row.outcome.missing()) {
            (Some(cause), _) => cause.to_string(),
            (None, Some(missing)) => format!(
                "missing: {}",
                missing.iter().cloned().collect::<Vec<_>>().join(";")
            ),
            (None, None) => String::new(),
        };
        let fields = row.fields();
        let mut record = vec![
            row.item.id.clone(),
            row.outcome.tag().to_string(),
            detail,
        ];
        record.extend(
            columns
                .iter()
                .map(|c| fields.get(*c).cloned().unwrap_or_default()),
        );
        wtr.write_record(&record).map_err(csv_err)?;
    }

    let buf = wtr
        .into_inner()
        .map_err(|e| io_err(io::Error::other(e.to_string())))?;
    let tmp = buf.into_inner().map_err(|e| io_err(e.into_error()))?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(output).map_err(|e| io_err(e.error))?;
    Ok(())
}
