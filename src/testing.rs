//! In-memory fakes for sessions and geocoding, used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::geocode::{GeocodeApi, GeocodeError, GeocodeRequest, GeocodeResponse};
use crate::model::FieldMap;
use crate::session::{FetchError, Fetcher, FieldSpec, SessionFactory};

#[derive(Clone)]
pub struct FakePage {
    anchor_present: bool,
    fields: FieldMap,
}

#[derive(Default)]
struct SiteState {
    pages: HashMap<String, FakePage>,
    failures: HashMap<String, VecDeque<FetchError>>,
    delays: HashMap<String, Duration>,
    panics: HashMap<String, usize>,
    fetches: HashMap<String, usize>,
    creations: usize,
    releases: usize,
}

/// A scripted website. Clones share state, so a test keeps one handle for
/// assertions and hands another to the code under test.
#[derive(Clone, Default)]
pub struct FakeSite {
    state: Arc<Mutex<SiteState>>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, fields: &[(&str, &str)]) -> Self {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state.lock().unwrap().pages.insert(
            url.to_string(),
            FakePage {
                anchor_present: true,
                fields,
            },
        );
        self
    }

    pub fn with_anchorless_page(self, url: &str) -> Self {
        self.state.lock().unwrap().pages.insert(
            url.to_string(),
            FakePage {
                anchor_present: false,
                fields: FieldMap::new(),
            },
        );
        self
    }

    /// Fail the next fetches of `url` with these errors, in order.
    pub fn fail_fetch(self, url: &str, errors: Vec<FetchError>) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(url.to_string())
            .or_default()
            .extend(errors);
        self
    }

    pub fn with_delay(self, url: &str, delay: Duration) -> Self {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(url.to_string(), delay);
        self
    }

    /// Panic on the next `times` fetches of `url`, simulating a worker crash.
    pub fn panic_on(self, url: &str, times: usize) -> Self {
        self.state
            .lock()
            .unwrap()
            .panics
            .insert(url.to_string(), times);
        self
    }

    pub fn creations(&self) -> usize {
        self.state.lock().unwrap().creations
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    pub fn fetches(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .fetches
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

impl SessionFactory for FakeSite {
    type Fetcher = FakeFetcher;

    fn create(&self) -> Result<FakeFetcher, FetchError> {
        self.state.lock().unwrap().creations += 1;
        Ok(FakeFetcher { site: self.clone() })
    }
}

pub struct FakeFetcher {
    site: FakeSite,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    type Page = FakePage;
    type Element = FieldMap;

    async fn fetch(&mut self, target: &str) -> Result<FakePage, FetchError> {
        let (result, delay, crash) = {
            let mut state = self.site.state.lock().unwrap();
            *state.fetches.entry(target.to_string()).or_default() += 1;
            let crash = match state.panics.get_mut(target) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            let failure = state.failures.get_mut(target).and_then(VecDeque::pop_front);
            let result = match failure {
                Some(e) => Err(e),
                None => state
                    .pages
                    .get(target)
                    .cloned()
                    .ok_or_else(|| FetchError::NotFound(target.to_string())),
            };
            (result, state.delays.get(target).copied(), crash)
        };
        if crash {
            panic!("simulated worker crash on {}", target);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn locate(&mut self, page: &FakePage, anchor: &str) -> Result<FieldMap, FetchError> {
        if page.anchor_present {
            Ok(page.fields.clone())
        } else {
            Err(FetchError::NotFound(anchor.to_string()))
        }
    }

    fn extract(&self, element: &FieldMap, field: &FieldSpec) -> Result<String, FetchError> {
        element
            .get(&field.name)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(field.name.clone()))
    }

    fn release(&mut self) {
        self.site.state.lock().unwrap().releases += 1;
    }
}

/// Geocoding API that replays canned JSON bodies per request key.
#[derive(Clone, Default)]
pub struct FakeGeocoder {
    responses: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
}

impl FakeGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw JSON response for requests whose key is `key`.
    pub fn respond(self, key: &str, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(body.to_string());
        self
    }

    pub fn unreachable(self, key: &str) -> Self {
        self.unreachable.lock().unwrap().insert(key.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn status_body(status: &str) -> String {
    format!(r#"{{"status":"{}","results":[]}}"#, status)
}

#[async_trait]
impl GeocodeApi for FakeGeocoder {
    async fn lookup(&self, request: &GeocodeRequest) -> Result<GeocodeResponse, GeocodeError> {
        let key = request.key();
        self.calls.lock().unwrap().push(key.clone());
        if self.unreachable.lock().unwrap().contains(&key) {
            return Err(GeocodeError::Transport("connection refused".into()));
        }
        let next = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        match next {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(serde_json::from_str(&status_body("ZERO_RESULTS"))?),
        }
    }
}
