//! Task sources: where work items come from.

pub mod csv_file;
pub mod links;
pub mod sitemap;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::merge::MergeError;
use crate::model::WorkItem;

pub use csv_file::{write_tasks, CsvSource};
pub use links::LinkSource;
pub use sitemap::SitemapSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no `{column}` column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("fetching sitemap: {0}")]
    Http(#[from] reqwest::Error),
    #[error("parsing sitemap: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid sitemap pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("reading previous results: {0}")]
    Merge(#[from] MergeError),
}

/// Loaded work items plus what was rejected on the way in.
#[derive(Debug, Default)]
pub struct TaskSet {
    pub items: Vec<WorkItem>,
    pub dropped_invalid: usize,
    pub dropped_duplicate: usize,
}

#[async_trait]
pub trait TaskSource {
    async fn load(&self) -> Result<TaskSet, SourceError>;
}
