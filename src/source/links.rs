use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info};

use super::{SourceError, TaskSet, TaskSource};
use crate::checkpoint::{CheckpointRow, CheckpointStore};
use crate::merge;
use crate::model::WorkItem;

/// Context column naming the item a followed link was found on.
pub const PARENT_COLUMN: &str = "parent_id";

/// Work items from links extracted by an earlier run. Each value of `field`
/// is resolved against the page it came from and becomes one task with id
/// `<parent>-<n>`.
pub struct LinkSource {
    store: CheckpointStore,
    field: String,
    separator: Option<String>,
}

impl LinkSource {
    /// `separator` splits a joined field; `None` treats the value as one link.
    pub fn new(store: CheckpointStore, field: &str, separator: Option<String>) -> Self {
        Self {
            store,
            field: field.to_string(),
            separator: separator.filter(|s| !s.is_empty()),
        }
    }

    fn follow(&self, rows: &[CheckpointRow]) -> TaskSet {
        let mut set = TaskSet::default();
        let mut seen = HashSet::new();

        for row in rows {
            let Some(value) = row.outcome.fields().and_then(|f| f.get(&self.field)) else {
                continue;
            };
            let base = Url::parse(&row.item.query).ok();
            let links: Vec<&str> = match &self.separator {
                Some(sep) => value.split(sep.as_str()).collect(),
                None => vec![value.as_str()],
            };

            let mut n = 0;
            for link in links.into_iter().map(str::trim).filter(|l| !l.is_empty()) {
                let resolved = match &base {
                    Some(base) => base.join(link),
                    None => Url::parse(link),
                };
                let Ok(url) = resolved else {
                    debug!(item = %row.item.id, link, "Skipping unresolvable link");
                    set.dropped_invalid += 1;
                    continue;
                };
                if !seen.insert(url.to_string()) {
                    set.dropped_duplicate += 1;
                    continue;
                }
                n += 1;
                let mut item = WorkItem::new(format!("{}-{}", row.item.id, n), url.to_string());
                item.context
                    .insert(PARENT_COLUMN.to_string(), row.item.id.clone());
                set.items.push(item);
            }
        }
        set
    }
}

#[async_trait]
impl TaskSource for LinkSource {
    async fn load(&self) -> Result<TaskSet, SourceError> {
        let merged = merge::collect(&self.store, &[])?;
        let set = self.follow(&merged.records);
        info!(
            "Followed `{}` from {} records: {} links ({} unresolvable, {} repeated)",
            self.field,
            merged.records.len(),
            set.items.len(),
            set.dropped_invalid,
            set.dropped_duplicate
        );
        Ok(set)
    }
}
