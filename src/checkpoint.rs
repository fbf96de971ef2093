//! Durable per-chunk result files.
//!
//! Layout of `<dir>/chunk-NNNNNN.csv`:
//!
//! ```text
//! # chunk=chunk-000003 complete=true written_at=2026-10-16T09:12:44.120Z
//! item_id,query,outcome,missing,error_detail,attempts,address,name,...
//! ```
//!
//! Field columns hold the outcome's fields, or the item's input columns
//! when the outcome carries no fields.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Chunk, ChunkId, ExtractionOutcome, FieldMap, OutcomeTag, WorkItem};

/// Column names owned by checkpoints and the final dataset.
pub const RESERVED_COLUMNS: &[&str] = &[
    "item_id",
    "query",
    "outcome",
    "missing",
    "error_detail",
    "attempts",
    "status",
];

const FIXED_COLUMNS: usize = 6;
const MISSING_SEP: char = ';';

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed checkpoint {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRow {
    pub item: WorkItem,
    pub outcome: ExtractionOutcome,
    pub attempts: usize,
}

impl CheckpointRow {
    /// Outcome fields, or the input columns for outcomes that carry none.
    pub fn fields(&self) -> &FieldMap {
        self.outcome.fields().unwrap_or(&self.item.context)
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub chunk_id: ChunkId,
    pub complete: bool,
    pub written_at: DateTime<Utc>,
    pub rows: Vec<CheckpointRow>,
}

impl Checkpoint {
    pub fn new(chunk_id: ChunkId, complete: bool, rows: Vec<CheckpointRow>) -> Self {
        Self {
            chunk_id,
            complete,
            written_at: Utc::now(),
            rows,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: ChunkId) -> PathBuf {
        self.dir.join(format!("{}.csv", id))
    }

    /// Atomically replace the checkpoint for `checkpoint.chunk_id`.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.path(checkpoint.chunk_id);
        let io_err = |source| CheckpointError::Io {
            path: path.clone(),
            source,
        };

        let tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .suffix(".csv")
            .tempfile_in(&self.dir)
            .map_err(io_err)?;
        let tmp = encode(checkpoint, tmp).map_err(|e| match e {
            EncodeError::Io(source) => io_err(source),
            EncodeError::Csv(source) => CheckpointError::Csv {
                path: path.clone(),
                source,
            },
        })?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        debug!(
            chunk = %checkpoint.chunk_id,
            rows = checkpoint.rows.len(),
            complete = checkpoint.complete,
            "Checkpoint written"
        );
        Ok(path)
    }

    pub fn read(&self, id: ChunkId) -> Result<Checkpoint, CheckpointError> {
        let path = self.path(id);
        let file = fs::File::open(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let mut meta = String::new();
        reader
            .read_line(&mut meta)
            .map_err(|source| CheckpointError::Io {
                path: path.clone(),
                source,
            })?;
        let (chunk_id, complete, written_at) = parse_meta(&meta).ok_or_else(|| {
            CheckpointError::Malformed {
                path: path.clone(),
                reason: format!("bad metadata line {:?}", meta.trim_end()),
            }
        })?;

        let rows = decode(reader).map_err(|e| match e {
            DecodeError::Csv(source) => CheckpointError::Csv {
                path: path.clone(),
                source,
            },
            DecodeError::Row(reason) => CheckpointError::Malformed {
                path: path.clone(),
                reason,
            },
        })?;

        Ok(Checkpoint {
            chunk_id,
            complete,
            written_at,
            rows,
        })
    }

    /// Whether a complete checkpoint exists for `chunk` holding exactly its
    /// items, in order. Unreadable checkpoints count as missing so the chunk
    /// is redone and the file replaced.
    pub fn covers(&self, chunk: &Chunk) -> Result<bool, CheckpointError> {
        let checkpoint = match self.read(chunk.id) {
            Ok(c) => c,
            Err(CheckpointError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(false)
            }
            Err(e @ CheckpointError::Io { .. }) => return Err(e),
            Err(e) => {
                warn!(chunk = %chunk.id, "Redoing unreadable checkpoint: {}", e);
                return Ok(false);
            }
        };
        let same_items = checkpoint.rows.len() == chunk.items.len()
            && checkpoint
                .rows
                .iter()
                .zip(&chunk.items)
                .all(|(row, item)| row.item.id == item.id && row.item.query == item.query);
        if checkpoint.complete && !same_items {
            warn!(chunk = %chunk.id, "Checkpoint holds different items, redoing chunk");
        }
        Ok(checkpoint.complete && same_items)
    }

    /// Persisted chunk ids, ascending. Temp files are ignored.
    pub fn list(&self) -> Result<Vec<ChunkId>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut ids: Vec<ChunkId> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let stem = name.to_str()?.strip_suffix(".csv")?;
                ChunkId::parse(stem)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Remove every checkpoint. Returns how many were deleted.
    pub fn clear(&self) -> Result<usize, CheckpointError> {
        self.prune(0)
    }

    /// Remove checkpoints for chunk ids `>= first`. Returns how many were
    /// deleted.
    pub fn prune(&self, first: usize) -> Result<usize, CheckpointError> {
        let stale: Vec<ChunkId> = self.list()?.into_iter().filter(|id| id.0 >= first).collect();
        for id in &stale {
            let path = self.path(*id);
            fs::remove_file(&path).map_err(|source| CheckpointError::Io { path, source })?;
        }
        Ok(stale.len())
    }
}

fn meta_line(checkpoint: &Checkpoint) -> String {
    format!(
        "# chunk={} complete={} written_at={}\n",
        checkpoint.chunk_id,
        checkpoint.complete,
        checkpoint
            .written_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

fn parse_meta(line: &str) -> Option<(ChunkId, bool, DateTime<Utc>)> {
    let rest = line.trim().strip_prefix('#')?;
    let pairs: HashMap<&str, &str> = rest
        .split_whitespace()
        .filter_map(|kv| kv.split_once('='))
        .collect();
    let id = ChunkId::parse(pairs.get("chunk")?)?;
    let complete = pairs.get("complete")?.parse().ok()?;
    let written_at = DateTime::parse_from_rfc3339(pairs.get("written_at")?)
        .ok()?
        .with_timezone(&Utc);
    Some((id, complete, written_at))
}

enum EncodeError {
    Io(io::Error),
    Csv(csv::Error),
}

fn encode(checkpoint: &Checkpoint, tmp: NamedTempFile) -> Result<NamedTempFile, EncodeError> {
    let columns: BTreeSet<&str> = checkpoint
        .rows
        .iter()
        .flat_map(|row| row.fields().keys().map(String::as_str))
        .collect();

    let mut out = BufWriter::new(tmp);
    out.write_all(meta_line(checkpoint).as_bytes())
        .map_err(EncodeError::Io)?;

    let mut wtr = csv::Writer::from_writer(out);
    let header = ["item_id", "query", "outcome", "missing", "error_detail", "attempts"]
        .into_iter()
        .chain(columns.iter().copied());
    wtr.write_record(header).map_err(EncodeError::Csv)?;

    for row in &checkpoint.rows {
        let missing = row
            .outcome
            .missing()
            .map(|m| m.iter().cloned().collect::<Vec<_>>().join(&MISSING_SEP.to_string()))
            .unwrap_or_default();
        let fields = row.fields();
        let mut record = vec![
            row.item.id.clone(),
            row.item.query.clone(),
            row.outcome.tag().to_string(),
            missing,
            row.outcome.cause().unwrap_or_default().to_string(),
            row.attempts.to_string(),
        ];
        record.extend(
            columns
                .iter()
                .map(|c| fields.get(*c).cloned().unwrap_or_default()),
        );
        wtr.write_record(&record).map_err(EncodeError::Csv)?;
    }

    let out = wtr
        .into_inner()
        .map_err(|e| EncodeError::Io(io::Error::other(e.to_string())))?;
    out.into_inner().map_err(|e| EncodeError::Io(e.into_error()))
}

enum DecodeError {
    Csv(csv::Error),
    Row(String),
}

fn decode(reader: impl io::Read) -> Result<Vec<CheckpointRow>, DecodeError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers().map_err(DecodeError::Csv)?.clone();
    if headers.len() < FIXED_COLUMNS {
        return Err(DecodeError::Row(format!(
            "expected at least {} columns, found {}",
            FIXED_COLUMNS,
            headers.len()
        )));
    }

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(DecodeError::Csv)?;
        let get = |i: usize| record.get(i).unwrap_or_default();

        let tag = OutcomeTag::parse(get(2))
            .ok_or_else(|| DecodeError::Row(format!("unknown outcome {:?}", get(2))))?;
        let missing: BTreeSet<String> = get(3)
            .split(MISSING_SEP)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let detail = Some(get(4).to_string()).filter(|s| !s.is_empty());
        let attempts = get(5)
            .parse()
            .map_err(|_| DecodeError::Row(format!("bad attempt count {:?}", get(5))))?;

        let fields: FieldMap = headers
            .iter()
            .enumerate()
            .skip(FIXED_COLUMNS)
            .filter(|(i, _)| !get(*i).is_empty())
            .map(|(i, name)| (name.to_string(), get(i).to_string()))
            .collect();

        let mut item = WorkItem::new(get(0), get(1));
        let outcome = if matches!(tag, OutcomeTag::Success | OutcomeTag::Partial) {
            ExtractionOutcome::from_parts(tag, fields, missing, detail)
        } else {
            item.context = fields;
            ExtractionOutcome::from_parts(tag, FieldMap::new(), missing, detail)
        };
        rows.push(CheckpointRow {
            item,
            outcome,
            attempts,
        });
    }
    Ok(rows)
}
