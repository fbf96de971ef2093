use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::model::{Attempt, ExtractionOutcome, ItemReport, Phase};

/// Bounded exponential-backoff retry around a single fallible attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { max_retries, base }
    }

    /// Wait after the `failed`-th failed attempt (1-based): `base * 2^(failed - 1)`.
    pub fn backoff(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp)
    }

    pub fn begin(&self, item_id: &str, phase: Phase) -> RetryRun<'_> {
        RetryRun {
            policy: self,
            item_id: item_id.to_string(),
            phase,
            attempts: Vec::new(),
        }
    }

    /// Run `op` until it returns a terminal outcome or retries are exhausted.
    pub async fn run<F, Fut>(&self, item_id: &str, phase: Phase, mut op: F) -> ItemReport
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ExtractionOutcome>,
    {
        let mut run = self.begin(item_id, phase);
        loop {
            let outcome = op(run.next_attempt()).await;
            match run.record(outcome) {
                Verdict::Retry(backoff) => tokio::time::sleep(backoff).await,
                Verdict::Done(report) => return report,
            }
        }
    }
}

pub enum Verdict {
    Retry(Duration),
    Done(ItemReport),
}

/// Attempt log for one item's retry sequence.
///
/// Only `TransientFailure` is retried. An exhausted transient failure is
/// reported as `FatalFailure` so the item is recorded rather than lost.
pub struct RetryRun<'p> {
    policy: &'p RetryPolicy,
    item_id: String,
    phase: Phase,
    attempts: Vec<Attempt>,
}

impl RetryRun<'_> {
    pub fn next_attempt(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn record(&mut self, outcome: ExtractionOutcome) -> Verdict {
        let number = self.next_attempt();
        self.attempts.push(Attempt {
            item_id: self.item_id.clone(),
            attempt_number: number,
            phase: self.phase,
            outcome: outcome.tag(),
            cause: outcome.cause().map(str::to_string),
            timestamp: Utc::now(),
        });

        let cause = match outcome {
            ExtractionOutcome::TransientFailure(cause) => cause,
            terminal => {
                debug!(item = %self.item_id, attempts = number, outcome = %terminal.tag(), "Attempt finished");
                return self.finish(terminal);
            }
        };

        if number > self.policy.max_retries {
            warn!(item = %self.item_id, attempts = number, "Retries exhausted: {}", cause);
            return self.finish(ExtractionOutcome::FatalFailure(format!(
                "retries exhausted after {} attempts: {}",
                number, cause
            )));
        }

        let backoff = self.policy.backoff(number);
        warn!(
            "Transient failure on {} (attempt {}/{}), backing off {:.1}s: {}",
            self.item_id,
            number,
            self.policy.max_retries + 1,
            backoff.as_secs_f64(),
            cause
        );
        Verdict::Retry(backoff)
    }

    fn finish(&mut self, outcome: ExtractionOutcome) -> Verdict {
        Verdict::Done(ItemReport {
            outcome,
            attempts: std::mem::take(&mut self.attempts),
        })
    }
}

/// Retry fallible I/O with the same backoff schedule. Returns the last error.
pub async fn retry_io<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failed = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if failed < policy.max_retries => {
                failed += 1;
                let backoff = policy.backoff(failed);
                warn!("{} failed (attempt {}), retrying in {:?}: {}", what, failed, backoff, e);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldMap, OutcomeTag};
    use std::cell::Cell;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(500))
    }

    fn success() -> ExtractionOutcome {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), "Store".into());
        ExtractionOutcome::Success(fields)
    }

    #[test]
    fn backoff_doubles() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1000));
        assert_eq!(p.backoff(3), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn k_transient_failures_then_success_logs_k_plus_one_attempts() {
        for k in 0..=3u32 {
            let calls = Cell::new(0u32);
            let report = policy()
                .run("item", Phase::Extract, |_| {
                    let n = calls.get();
                    calls.set(n + 1);
                    async move {
                        if n < k {
                            ExtractionOutcome::TransientFailure("timeout".into())
                        } else {
                            success()
                        }
                    }
                })
                .await;
            assert_eq!(report.outcome, success());
            assert_eq!(report.attempts.len(), (k + 1) as usize);
            let numbers: Vec<_> = report.attempts.iter().map(|a| a.attempt_number).collect();
            assert_eq!(numbers, (1..=k + 1).collect::<Vec<_>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_becomes_fatal() {
        let report = policy()
            .run("item", Phase::Extract, |_| async {
                ExtractionOutcome::TransientFailure("HTTP 503".into())
            })
            .await;
        assert_eq!(report.attempts.len(), 4);
        match report.outcome {
            ExtractionOutcome::FatalFailure(cause) => {
                assert!(cause.contains("retries exhausted after 4 attempts"));
                assert!(cause.contains("HTTP 503"));
            }
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_outcomes_are_not_retried() {
        for outcome in [
            ExtractionOutcome::NotFound,
            ExtractionOutcome::FatalFailure("session lost".into()),
            success(),
        ] {
            let expected = outcome.clone();
            let report = policy()
                .run("item", Phase::Extract, |_| {
                    let o = outcome.clone();
                    async move { o }
                })
                .await;
            assert_eq!(report.outcome, expected);
            assert_eq!(report.attempts.len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_observed_between_attempts() {
        let start = tokio::time::Instant::now();
        let report = policy()
            .run("item", Phase::Geocode, |n| async move {
                if n < 3 {
                    ExtractionOutcome::TransientFailure("busy".into())
                } else {
                    success()
                }
            })
            .await;
        assert_eq!(report.attempts[0].outcome, OutcomeTag::Transient);
        // 500ms after the first failure, 1000ms after the second.
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_io_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_io(&policy(), "write", || {
            calls.set(calls.get() + 1);
            async { Err("disk full".to_string()) }
        })
        .await;
        assert_eq!(result, Err("disk full".to_string()));
        assert_eq!(calls.get(), 4);
    }
}
