//! Extraction session: one exclusive fetch resource driving the
//! navigate → locate → extract → validate state machine for one item.

pub mod http;
pub mod plan;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{ExtractionOutcome, FieldMap, ItemReport, Phase, WorkItem};
use crate::rate_limit::EndpointLimiter;
use crate::retry::{RetryPolicy, Verdict};
pub use plan::{ExtractionPlan, FieldSpec, PlanConfig, PlanError};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Transient(String),
    /// Permanent for this item; the session stays usable.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The fetch resource itself is broken and must be recreated.
    #[error("session unusable: {0}")]
    SessionLost(String),
}

impl FetchError {
    fn into_terminal(self) -> Terminal {
        match self {
            Self::NotFound(_) => Terminal::new(ExtractionOutcome::NotFound),
            Self::Timeout(_) | Self::Transient(_) => {
                Terminal::new(ExtractionOutcome::TransientFailure(self.to_string()))
            }
            Self::Rejected(_) => Terminal::new(ExtractionOutcome::FatalFailure(self.to_string())),
            Self::SessionLost(_) => Terminal {
                outcome: ExtractionOutcome::FatalFailure(self.to_string()),
                session_lost: true,
            },
        }
    }
}

/// Capability interface over a browser-like session or HTTP client.
#[async_trait]
pub trait Fetcher: Send {
    type Page: Send + Sync;
    type Element: Send + Sync;

    async fn fetch(&mut self, target: &str) -> Result<Self::Page, FetchError>;

    async fn locate(&mut self, page: &Self::Page, anchor: &str)
        -> Result<Self::Element, FetchError>;

    fn extract(&self, element: &Self::Element, field: &FieldSpec) -> Result<String, FetchError>;

    /// Reset per-item state. Called exactly once after every attempt.
    fn release(&mut self);
}

pub trait SessionFactory: Send + Sync {
    type Fetcher: Fetcher + 'static;

    fn create(&self) -> Result<Self::Fetcher, FetchError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub load: Duration,
    pub locate: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            load: Duration::from_secs(30),
            locate: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Navigating,
    Locating,
    Extracting,
    Validating,
    Terminal,
}

enum Step<P, E> {
    Navigate,
    Locate(P),
    Extract(E),
    Validate {
        fields: FieldMap,
        missing: BTreeSet<String>,
    },
    Done(Terminal),
}

impl<P, E> Step<P, E> {
    fn state(&self) -> SessionState {
        match self {
            Step::Navigate => SessionState::Navigating,
            Step::Locate(_) => SessionState::Locating,
            Step::Extract(_) => SessionState::Extracting,
            Step::Validate { .. } => SessionState::Validating,
            Step::Done(_) => SessionState::Terminal,
        }
    }
}

struct Terminal {
    outcome: ExtractionOutcome,
    session_lost: bool,
}

impl Terminal {
    fn new(outcome: ExtractionOutcome) -> Self {
        Self {
            outcome,
            session_lost: false,
        }
    }
}

/// Scoped hold on the fetch resource. Released exactly once, on every path.
struct Lease<F: Fetcher> {
    fetcher: Option<F>,
}

impl<F: Fetcher> Lease<F> {
    fn new(fetcher: F) -> Self {
        Self {
            fetcher: Some(fetcher),
        }
    }

    fn resource(&mut self) -> Option<&mut F> {
        self.fetcher.as_mut()
    }

    fn release(mut self) -> Option<F> {
        let mut fetcher = self.fetcher.take()?;
        fetcher.release();
        Some(fetcher)
    }
}

impl<F: Fetcher> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(fetcher) = self.fetcher.as_mut() {
            fetcher.release();
        }
    }
}

pub struct ExtractionSession<S: SessionFactory> {
    factory: Arc<S>,
    fetcher: Option<S::Fetcher>,
    plan: Arc<ExtractionPlan>,
    limiter: Option<Arc<EndpointLimiter>>,
    timeouts: SessionTimeouts,
    recreations: usize,
}

impl<S: SessionFactory> ExtractionSession<S> {
    pub fn new(factory: Arc<S>, plan: Arc<ExtractionPlan>, timeouts: SessionTimeouts) -> Self {
        Self {
            factory,
            fetcher: None,
            plan,
            limiter: None,
            timeouts,
            recreations: 0,
        }
    }

    pub fn with_limiter(mut self, limiter: Option<Arc<EndpointLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Attempt `item` under `policy` until a terminal outcome.
    pub async fn run(&mut self, item: &WorkItem, policy: &RetryPolicy) -> ItemReport {
        let mut retry = policy.begin(&item.id, Phase::Extract);
        loop {
            let outcome = self.attempt(item).await;
            match retry.record(outcome) {
                Verdict::Retry(backoff) => tokio::time::sleep(backoff).await,
                Verdict::Done(report) => return report,
            }
        }
    }

    /// Run one attempt at `item` from `Idle` to a terminal outcome.
    pub async fn attempt(&mut self, item: &WorkItem) -> ExtractionOutcome {
        let fetcher = match self.fetcher.take() {
            Some(f) => f,
            None => match self.factory.create() {
                Ok(f) => f,
                Err(e) => {
                    warn!(item = %item.id, "Could not create fetch session: {}", e);
                    return ExtractionOutcome::FatalFailure(e.to_string());
                }
            },
        };

        let mut lease = Lease::new(fetcher);
        let terminal = match lease.resource() {
            Some(fetcher) => {
                drive(
                    fetcher,
                    item,
                    &self.plan,
                    self.limiter.as_deref(),
                    self.timeouts,
                )
                .await
            }
            None => Terminal {
                outcome: ExtractionOutcome::FatalFailure("fetch resource missing".into()),
                session_lost: true,
            },
        };
        let fetcher = lease.release();

        if terminal.session_lost {
            self.recreations += 1;
            warn!(item = %item.id, recreations = self.recreations, "Discarding fetch session after fatal fault");
        } else {
            self.fetcher = fetcher;
        }
        terminal.outcome
    }
}

async fn drive<F: Fetcher>(
    fetcher: &mut F,
    item: &WorkItem,
    plan: &ExtractionPlan,
    limiter: Option<&EndpointLimiter>,
    timeouts: SessionTimeouts,
) -> Terminal {
    debug!(item = %item.id, state = ?SessionState::Idle, "Session start");
    let mut step: Step<F::Page, F::Element> = Step::Navigate;

    loop {
        debug!(item = %item.id, state = ?step.state(), "Session step");
        step = match step {
            Step::Navigate => navigate(fetcher, &item.query, limiter, timeouts.load).await,
            Step::Locate(page) => {
                match tokio::time::timeout(timeouts.locate, fetcher.locate(&page, &plan.anchor))
                    .await
                {
                    // No anchor within the wait: the source lacks the item.
                    Err(_) => Step::Done(Terminal::new(ExtractionOutcome::NotFound)),
                    Ok(Err(e)) => Step::Done(e.into_terminal()),
                    Ok(Ok(element)) => Step::Extract(element),
                }
            }
            Step::Extract(element) => extract_fields(&*fetcher, &element, plan, &item.id),
            Step::Validate { fields, missing } => {
                let outcome = if fields.is_empty() {
                    ExtractionOutcome::NotFound
                } else if missing.is_empty() {
                    ExtractionOutcome::Success(fields)
                } else {
                    ExtractionOutcome::PartialSuccess { fields, missing }
                };
                Step::Done(Terminal::new(outcome))
            }
            Step::Done(terminal) => return terminal,
        };
    }
}

async fn navigate<F: Fetcher>(
    fetcher: &mut F,
    target: &str,
    limiter: Option<&EndpointLimiter>,
    load: Duration,
) -> Step<F::Page, F::Element> {
    if let Some(limiter) = limiter {
        if let Err(e) = limiter.acquire().await {
            return Step::Done(Terminal::new(ExtractionOutcome::TransientFailure(
                e.to_string(),
            )));
        }
    }
    match tokio::time::timeout(load, fetcher.fetch(target)).await {
        Err(_) => Step::Done(Terminal::new(ExtractionOutcome::TransientFailure(format!(
            "load timeout after {:?}",
            load
        )))),
        Ok(Err(e)) => Step::Done(e.into_terminal()),
        Ok(Ok(page)) => Step::Locate(page),
    }
}

fn extract_fields<F: Fetcher>(
    fetcher: &F,
    element: &F::Element,
    plan: &ExtractionPlan,
    item_id: &str,
) -> Step<F::Page, F::Element> {
    let mut fields = FieldMap::new();
    let mut missing = BTreeSet::new();

    for field in &plan.fields {
        let value = match fetcher.extract(element, &field.spec) {
            Ok(raw) => field.refine(&raw),
            Err(e @ FetchError::SessionLost(_)) => return Step::Done(e.into_terminal()),
            Err(e) => {
                debug!(item = item_id, field = %field.spec.name, "Field extraction failed: {}", e);
                None
            }
        };
        match value {
            Some(v) => {
                fields.insert(field.spec.name.clone(), v);
            }
            None if field.spec.required => {
                missing.insert(field.spec.name.clone());
            }
            None => {}
        }
    }

    Step::Validate { fields, missing }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutcomeTag;
    use crate::testing::FakeSite;

    fn plan() -> Arc<ExtractionPlan> {
        Arc::new(
            ExtractionPlan::compile(PlanConfig {
                anchor: "div.store".into(),
                fields: vec![
                    FieldSpec::new("name", "h1"),
                    FieldSpec::new("address", "li.address"),
                ],
            })
            .unwrap(),
        )
    }

    fn session(site: &FakeSite) -> ExtractionSession<FakeSite> {
        ExtractionSession::new(Arc::new(site.clone()), plan(), SessionTimeouts::default())
    }

    fn store_fields() -> Vec<(&'static str, &'static str)> {
        vec![("name", "PAM Milano"), ("address", "Via Roma 1, Milano")]
    }

    #[tokio::test]
    async fn all_fields_present_is_success() {
        let site = FakeSite::new().with_page("https://example/store/1", &store_fields());
        let outcome = session(&site).attempt(&WorkItem::new("1", "https://example/store/1")).await;
        let fields = outcome.fields().unwrap();
        assert_eq!(outcome.tag(), OutcomeTag::Success);
        assert_eq!(fields["name"], "PAM Milano");
        assert_eq!(site.releases(), 1);
    }

    #[tokio::test]
    async fn some_fields_missing_is_partial() {
        let site = FakeSite::new().with_page("https://example/store/1", &[("name", "PAM Milano")]);
        let outcome = session(&site).attempt(&WorkItem::new("1", "https://example/store/1")).await;
        match outcome {
            ExtractionOutcome::PartialSuccess { fields, missing } => {
                assert_eq!(fields.len(), 1);
                assert!(missing.contains("address"));
            }
            other => panic!("expected partial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_fields_present_is_not_found() {
        let site = FakeSite::new().with_page("https://example/store/1", &[("phone", "02 123")]);
        let outcome = session(&site).attempt(&WorkItem::new("1", "https://example/store/1")).await;
        assert_eq!(outcome, ExtractionOutcome::NotFound);
    }

    #[tokio::test]
    async fn missing_anchor_is_not_found_without_retry() {
        let site = FakeSite::new().with_anchorless_page("https://example/store/1");
        let item = WorkItem::new("1", "https://example/store/1");
        let mut session = session(&site);
        let report = session
            .run(&item, &RetryPolicy::new(3, Duration::from_millis(10)))
            .await;
        assert_eq!(report.outcome, ExtractionOutcome::NotFound);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(site.fetches("https://example/store/1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_twice_then_success_logs_three_attempts() {
        let site = FakeSite::new()
            .with_page("https://example/store/2", &store_fields())
            .fail_fetch(
                "https://example/store/2",
                vec![
                    FetchError::Timeout("page load".into()),
                    FetchError::Timeout("page load".into()),
                ],
            );
        let item = WorkItem::new("2", "https://example/store/2");
        let mut session = session(&site);
        let report = session
            .run(&item, &RetryPolicy::new(3, Duration::from_millis(500)))
            .await;
        assert_eq!(report.outcome.tag(), OutcomeTag::Success);
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(site.releases(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_times_out_as_transient() {
        let site = FakeSite::new()
            .with_page("https://example/store/3", &store_fields())
            .with_delay("https://example/store/3", Duration::from_secs(60));
        let outcome = session(&site).attempt(&WorkItem::new("3", "https://example/store/3")).await;
        assert_eq!(outcome.tag(), OutcomeTag::Transient);
        assert_eq!(site.releases(), 1);
    }

    #[tokio::test]
    async fn lost_session_is_recreated_for_next_item() {
        let site = FakeSite::new()
            .with_page("https://example/store/1", &store_fields())
            .with_page("https://example/store/2", &store_fields())
            .fail_fetch(
                "https://example/store/1",
                vec![FetchError::SessionLost("browser crashed".into())],
            );
        let mut session = session(&site);

        let first = session.attempt(&WorkItem::new("1", "https://example/store/1")).await;
        assert_eq!(first.tag(), OutcomeTag::Fatal);
        let second = session.attempt(&WorkItem::new("2", "https://example/store/2")).await;
        assert_eq!(second.tag(), OutcomeTag::Success);

        assert_eq!(session.recreations, 1);
        assert_eq!(site.creations(), 2);
        assert_eq!(site.releases(), 2);
    }

    #[tokio::test]
    async fn resource_released_once_per_terminal_outcome() {
        let site = FakeSite::new()
            .with_page("https://example/ok", &store_fields())
            .with_anchorless_page("https://example/empty")
            .fail_fetch("https://example/flaky", vec![FetchError::Transient("reset".into())])
            .fail_fetch("https://example/denied", vec![FetchError::Rejected("HTTP 403".into())]);
        let mut session = session(&site);
        let targets = [
            "https://example/ok",
            "https://example/empty",
            "https://example/flaky",
            "https://example/denied",
            "https://example/unknown",
        ];
        for (i, target) in targets.iter().enumerate() {
            session.attempt(&WorkItem::new(i.to_string(), *target)).await;
            assert_eq!(site.releases(), i + 1);
        }
        assert_eq!(site.creations(), 1);
    }
}
