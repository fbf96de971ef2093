//! Plain HTTP fetch backend: GET the target, parse HTML with `scraper`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};

use super::{ExtractionPlan, FetchError, Fetcher, FieldSpec, PlanError, SessionFactory};

pub const DEFAULT_USER_AGENT: &str = concat!("store_harvester/", env!("CARGO_PKG_VERSION"));

pub struct HtmlPage {
    pub url: String,
    pub body: String,
}

/// Outer HTML of the located anchor.
pub struct HtmlElement {
    pub html: String,
}

pub struct HttpSessionFactory {
    selectors: Arc<HashMap<String, Selector>>,
    user_agent: String,
    timeout: Duration,
}

impl HttpSessionFactory {
    /// Compile every selector in `plan` up front so a bad plan fails
    /// before any item is processed.
    pub fn new(plan: &ExtractionPlan, user_agent: &str, timeout: Duration) -> Result<Self, PlanError> {
        let mut selectors = HashMap::new();
        for raw in plan.selectors() {
            let selector = Selector::parse(raw).map_err(|e| PlanError::Selector {
                selector: raw.to_string(),
                reason: format!("{:?}", e),
            })?;
            selectors.insert(raw.to_string(), selector);
        }
        Ok(Self {
            selectors: Arc::new(selectors),
            user_agent: user_agent.to_string(),
            timeout,
        })
    }
}

impl SessionFactory for HttpSessionFactory {
    type Fetcher = HttpFetcher;

    fn create(&self) -> Result<HttpFetcher, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .build()
            .map_err(|e| FetchError::SessionLost(e.to_string()))?;
        Ok(HttpFetcher {
            client,
            selectors: Arc::clone(&self.selectors),
        })
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    selectors: Arc<HashMap<String, Selector>>,
}

impl HttpFetcher {
    fn selector(&self, raw: &str) -> Result<&Selector, FetchError> {
        self.selectors
            .get(raw)
            .ok_or_else(|| FetchError::Rejected(format!("selector `{}` not in plan", raw)))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    type Page = HtmlPage;
    type Element = HtmlElement;

    async fn fetch(&mut self, target: &str) -> Result<HtmlPage, FetchError> {
        let response = self.client.get(target).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(target.to_string())
            } else if e.is_builder() {
                FetchError::Rejected(e.to_string())
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if let Some(err) = classify_status(status, target) {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("reading body of {}: {}", target, e)))?;
        Ok(HtmlPage {
            url: target.to_string(),
            body,
        })
    }

    async fn locate(&mut self, page: &HtmlPage, anchor: &str) -> Result<HtmlElement, FetchError> {
        let selector = self.selector(anchor)?;
        find_anchor(&page.body, selector)
            .map(|html| HtmlElement { html })
            .ok_or_else(|| FetchError::NotFound(format!("{} on {}", anchor, page.url)))
    }

    fn extract(&self, element: &HtmlElement, field: &FieldSpec) -> Result<String, FetchError> {
        let selector = field.selector.as_deref().map(|s| self.selector(s)).transpose()?;
        extract_value(&element.html, selector, field)
            .ok_or_else(|| FetchError::NotFound(field.name.clone()))
    }

    fn release(&mut self) {}
}

fn classify_status(status: StatusCode, target: &str) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("HTTP {} for {}", status.as_u16(), target);
    Some(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => FetchError::Transient(detail),
        s if s.is_server_error() => FetchError::Transient(detail),
        _ => FetchError::Rejected(detail),
    })
}

fn find_anchor(body: &str, selector: &Selector) -> Option<String> {
    let document = Html::parse_document(body);
    let anchor = document.select(selector).next().map(|el| el.html());
    anchor
}

fn extract_value(anchor_html: &str, selector: Option<&Selector>, field: &FieldSpec) -> Option<String> {
    let fragment = Html::parse_fragment(anchor_html);
    let root = fragment.root_element();
    let anchor = root.children().find_map(ElementRef::wrap).unwrap_or(root);

    let read = |el: ElementRef| -> Option<String> {
        let raw = match &field.attr {
            Some(attr) => el.value().attr(attr)?.to_string(),
            None => el.text().collect::<Vec<_>>().join(" "),
        };
        let value = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        (!value.is_empty()).then_some(value)
    };

    let Some(selector) = selector else {
        return read(anchor);
    };
    match &field.join {
        Some(sep) => {
            let values: Vec<String> = anchor.select(selector).filter_map(read).collect();
            (!values.is_empty()).then(|| values.join(sep))
        }
        None => anchor.select(selector).find_map(read),
    }
}
