//! Per-item processing run by dispatcher workers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::geocode::{geocode_status, Enricher, LocationColumns};
use crate::model::{ExtractionOutcome, ItemReport, WorkItem};
use crate::rate_limit::EndpointLimiter;
use crate::retry::RetryPolicy;
use crate::session::{ExtractionPlan, ExtractionSession, SessionFactory, SessionTimeouts};

/// Turns one work item into a terminal report. Owned by exactly one worker.
#[async_trait]
pub trait ItemProcessor: Send {
    async fn process(&mut self, item: &WorkItem) -> ItemReport;
}

pub trait ProcessorFactory: Send + Sync + 'static {
    type Processor: ItemProcessor + 'static;

    fn create(&self) -> Self::Processor;
}

/// Shared settings for building scrape processors.
pub struct ScrapeSetup<S: SessionFactory> {
    pub sessions: Arc<S>,
    pub plan: Arc<ExtractionPlan>,
    pub timeouts: SessionTimeouts,
    pub limiter: Option<Arc<EndpointLimiter>>,
    pub retry: RetryPolicy,
    pub enricher: Option<Arc<Enricher>>,
    pub location: LocationColumns,
    /// Copy input columns into the record alongside extracted fields.
    pub carry_context: bool,
}

impl<S: SessionFactory + 'static> ProcessorFactory for ScrapeSetup<S> {
    type Processor = ScrapeProcessor<S>;

    fn create(&self) -> ScrapeProcessor<S> {
        let session = ExtractionSession::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.plan),
            self.timeouts,
        )
        .with_limiter(self.limiter.clone());
        ScrapeProcessor {
            session,
            retry: self.retry,
            enricher: self.enricher.clone(),
            location: self.location.clone(),
            carry_context: self.carry_context,
        }
    }
}

pub struct ScrapeProcessor<S: SessionFactory> {
    session: ExtractionSession<S>,
    retry: RetryPolicy,
    enricher: Option<Arc<Enricher>>,
    location: LocationColumns,
    carry_context: bool,
}

#[async_trait]
impl<S: SessionFactory + 'static> ItemProcessor for ScrapeProcessor<S> {
    async fn process(&mut self, item: &WorkItem) -> ItemReport {
        let mut report = self.session.run(item, &self.retry).await;

        let Some(fields) = report.outcome.fields_mut() else {
            return report;
        };
        if self.carry_context {
            for (key, value) in &item.context {
                fields.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        if let Some(enricher) = &self.enricher {
            let location = self.location.locate(fields);
            let geocoded = enricher.enrich(&item.id, &location).await;
            let status = geocode_status(geocoded.as_ref().map(|r| &r.outcome));
            if let Some(geo) = geocoded {
                if let Some(components) = geo.outcome.fields() {
                    fields.extend(components.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                report.attempts.extend(geo.attempts);
            }
            fields.insert("geocode_status".into(), status);
        }
        report
    }
}

/// Geocode-only runs: the lookup outcome is the item outcome.
pub struct GeocodeSetup {
    pub enricher: Arc<Enricher>,
    pub location: LocationColumns,
}

impl ProcessorFactory for GeocodeSetup {
    type Processor = GeocodeProcessor;

    fn create(&self) -> GeocodeProcessor {
        GeocodeProcessor {
            enricher: Arc::clone(&self.enricher),
            location: self.location.clone(),
        }
    }
}

pub struct GeocodeProcessor {
    enricher: Arc<Enricher>,
    location: LocationColumns,
}

#[async_trait]
impl ItemProcessor for GeocodeProcessor {
    async fn process(&mut self, item: &WorkItem) -> ItemReport {
        let mut location = self.location.locate(&item.context);
        if location.address.is_none() && !item.query.trim().is_empty() {
            location.address = Some(self.location.with_suffix(item.query.trim()));
        }

        let Some(mut report) = self.enricher.enrich(&item.id, &location).await else {
            return ItemReport {
                outcome: ExtractionOutcome::FatalFailure("no usable address or coordinates".into()),
                attempts: Vec::new(),
            };
        };

        let status = geocode_status(Some(&report.outcome));
        if let Some(fields) = report.outcome.fields_mut() {
            let components = std::mem::take(fields);
            fields.extend(item.context.iter().map(|(k, v)| (k.clone(), v.clone())));
            fields.extend(components);
            fields.insert("geocode_status".into(), status);
        }
        report
    }
}
