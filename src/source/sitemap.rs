use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use super::{SourceError, TaskSet, TaskSource};
use crate::model::WorkItem;

/// Work items discovered from a `urlset` sitemap. Only `<loc>` URLs matching
/// `pattern` are kept; its first capture group becomes the item id.
pub struct SitemapSource {
    pub url: String,
    pattern: Regex,
    client: reqwest::Client,
}

impl SitemapSource {
    pub fn new(url: &str, pattern: &str, client: reqwest::Client) -> Result<Self, SourceError> {
        Ok(Self {
            url: url.to_string(),
            pattern: Regex::new(pattern)?,
            client,
        })
    }
}

#[async_trait]
impl TaskSource for SitemapSource {
    async fn load(&self) -> Result<TaskSet, SourceError> {
        info!("Fetching sitemap: {}", self.url);
        let xml = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let all_urls = parse_urlset(&xml)?;
        info!("Total URLs in sitemap: {}", all_urls.len());

        let set = select(all_urls, &self.pattern);
        info!("Pages after filtering: {}", set.items.len());
        Ok(set)
    }
}

fn select(urls: Vec<String>, pattern: &Regex) -> TaskSet {
    let mut set = TaskSet::default();
    let mut seen = HashSet::new();
    for url in urls {
        let Some(id) = pattern
            .captures(&url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
        else {
            set.dropped_invalid += 1;
            continue;
        };
        if !seen.insert(id.clone()) {
            set.dropped_duplicate += 1;
            continue;
        }
        set.items.push(WorkItem::new(id, url));
    }
    set
}

/// Parse a urlset XML and return all <loc> URLs.
fn parse_urlset(xml: &str) -> Result<Vec<String>, SourceError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            quick_xml::events::Event::Start(e) => match e.name().as_ref() {
                b"url" => in_url = true,
                b"loc" if in_url => in_loc = true,
                _ => {}
            },
            quick_xml::events::Event::Text(e) if in_loc => {
                let loc = e.unescape()?;
                let loc = loc.trim();
                if !loc.is_empty() {
                    urls.push(loc.to_string());
                }
            }
            quick_xml::events::Event::End(e) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                _ => {}
            },
            quick_xml::events::Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}
