use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered field map. Ordering keeps checkpoint and output columns stable.
pub type FieldMap = BTreeMap<String, String>;

/// One unit of extraction work: a target plus the auxiliary input columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub query: String,
    pub context: FieldMap,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            context: FieldMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Terminal classification of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Success(FieldMap),
    PartialSuccess {
        fields: FieldMap,
        missing: BTreeSet<String>,
    },
    NotFound,
    TransientFailure(String),
    FatalFailure(String),
}

impl ExtractionOutcome {
    pub fn tag(&self) -> OutcomeTag {
        match self {
            Self::Success(_) => OutcomeTag::Success,
            Self::PartialSuccess { .. } => OutcomeTag::Partial,
            Self::NotFound => OutcomeTag::NotFound,
            Self::TransientFailure(_) => OutcomeTag::Transient,
            Self::FatalFailure(_) => OutcomeTag::Fatal,
        }
    }

    pub fn fields(&self) -> Option<&FieldMap> {
        match self {
            Self::Success(fields) | Self::PartialSuccess { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut FieldMap> {
        match self {
            Self::Success(fields) | Self::PartialSuccess { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn missing(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::PartialSuccess { missing, .. } => Some(missing),
            _ => None,
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            Self::TransientFailure(cause) | Self::FatalFailure(cause) => Some(cause),
            _ => None,
        }
    }

    /// Rebuild an outcome from its persisted parts.
    pub fn from_parts(
        tag: OutcomeTag,
        fields: FieldMap,
        missing: BTreeSet<String>,
        detail: Option<String>,
    ) -> Self {
        match tag {
            OutcomeTag::Success => Self::Success(fields),
            OutcomeTag::Partial => Self::PartialSuccess { fields, missing },
            OutcomeTag::NotFound => Self::NotFound,
            OutcomeTag::Transient => Self::TransientFailure(detail.unwrap_or_default()),
            OutcomeTag::Fatal => Self::FatalFailure(detail.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Success,
    Partial,
    NotFound,
    Transient,
    Fatal,
}

impl OutcomeTag {
    pub const ALL: [OutcomeTag; 5] = [
        OutcomeTag::Success,
        OutcomeTag::Partial,
        OutcomeTag::NotFound,
        OutcomeTag::Fatal,
        OutcomeTag::Transient,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Higher is better when several outcomes exist for one item.
    pub fn rank(self) -> u8 {
        match self {
            Self::Success => 4,
            Self::Partial => 3,
            Self::NotFound => 2,
            Self::Fatal => 1,
            Self::Transient => 0,
        }
    }
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Extract,
    Geocode,
}

/// Append-only log entry for one attempt at one item.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub item_id: String,
    pub attempt_number: u32,
    pub phase: Phase,
    pub outcome: OutcomeTag,
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Stable chunk identity, derived from position in the task enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub usize);

impl ChunkId {
    const PREFIX: &'static str = "chunk-";

    pub fn parse(s: &str) -> Option<Self> {
        let digits = s.strip_prefix(Self::PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(ChunkId)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:06}", Self::PREFIX, self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub items: Vec<WorkItem>,
}

/// Split items into fixed-size chunks. Ids follow enumeration order.
pub fn partition(items: Vec<WorkItem>, chunk_size: usize) -> Vec<Chunk> {
    let size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        let items: Vec<_> = iter.by_ref().take(size).collect();
        chunks.push(Chunk {
            id: ChunkId(chunks.len()),
            items,
        });
    }
    chunks
}

/// Outcome and attempt log for one item, as recorded in a checkpoint.
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub outcome: ExtractionOutcome,
    pub attempts: Vec<Attempt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(i.to_string(), format!("https://example/store/{i}")))
            .collect()
    }

    #[test]
    fn partition_covers_every_item_once() {
        let chunks = partition(items(23), 5);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].items.len(), 3);
        let ids: Vec<_> = chunks
            .iter()
            .flat_map(|c| c.items.iter().map(|i| i.id.clone()))
            .collect();
        assert_eq!(ids, (0..23).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn chunk_ids_are_positional() {
        let a = partition(items(10), 4);
        let b = partition(items(10), 4);
        let ids_a: Vec<_> = a.iter().map(|c| c.id).collect();
        let ids_b: Vec<_> = b.iter().map(|c| c.id).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a[2].id.to_string(), "chunk-000002");
    }

    #[test]
    fn chunk_id_parse() {
        assert_eq!(ChunkId::parse("chunk-000042"), Some(ChunkId(42)));
        assert_eq!(ChunkId::parse("chunk-"), None);
        assert_eq!(ChunkId::parse("chunk-12a"), None);
        assert_eq!(ChunkId::parse("other-000001"), None);
    }

    #[test]
    fn tag_roundtrip_and_rank() {
        for tag in OutcomeTag::ALL {
            assert_eq!(OutcomeTag::parse(tag.as_str()), Some(tag));
        }
        assert!(OutcomeTag::Success.rank() > OutcomeTag::Partial.rank());
        assert!(OutcomeTag::NotFound.rank() > OutcomeTag::Fatal.rank());
    }
}
