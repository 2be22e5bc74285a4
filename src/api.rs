use crate::model::{Bootstrap, Fixture, ManagerPicks, StandingsPage, Transfer};
use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

const SHORT_TIMEOUT: Duration = Duration::from_secs(60);
const LONG_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum FetchError {
    Status { url: String, status: u16 },
    Transport { url: String, message: String },
    SchemaMismatch { url: String, message: String },
}

impl FetchError {
    /// Transport failures, throttling and server errors may clear up on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { .. } => true,
            FetchError::SchemaMismatch { .. } => false,
        }
    }

    /// Any request that did not come back with a 200; a readable but malformed body is not.
    pub fn is_request_failure(&self) -> bool {
        !matches!(self, FetchError::SchemaMismatch { .. })
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status { url, status } => {
                write!(f, "request to {} failed with status {}", url, status)
            }
            FetchError::Transport { url, message } => {
                write!(f, "request to {} failed: {}", url, message)
            }
            FetchError::SchemaMismatch { url, message } => {
                write!(f, "unexpected response from {}: {}", url, message)
            }
        }
    }
}

impl Error for FetchError {}

/// How often, and how patiently, a fetch is repeated.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second, third, ... attempt. The last entry repeats.
    pub backoff: Vec<Duration>,
    pub retryable: fn(&FetchError) -> bool,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Vec::new(),
            retryable: |_| false,
        }
    }

    /// Picks endpoints flap per manager, so every non-200 response is tried again, 404s
    /// included.
    pub fn manager_picks() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![Duration::from_secs(1), Duration::from_secs(3)],
            retryable: FetchError::is_request_failure,
        }
    }

    fn delay_before(&self, attempt: u32) -> Option<Duration> {
        let idx = attempt.checked_sub(2)? as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && (self.retryable)(&e) => {
                    attempt += 1;
                    warn!("{}, attempt {} of {}", e, attempt, self.max_attempts);
                    if let Some(delay) = self.delay_before(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A response that may be followed by further pages.
pub trait Page {
    type Item;

    fn has_next(&self) -> bool;

    fn into_items(self) -> Vec<Self::Item>;
}

impl Page for StandingsPage {
    type Item = crate::model::Standing;

    fn has_next(&self) -> bool {
        self.standings.has_next
    }

    fn into_items(self) -> Vec<Self::Item> {
        self.standings.results
    }
}

/// Fetches pages 1, 2, ... until one reports no next page. Any failure discards what was
/// gathered so far.
pub async fn paginate<P, F, Fut>(mut fetch_page: F) -> Result<Vec<P::Item>, FetchError>
where
    P: Page,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<P, FetchError>>,
{
    let mut items = Vec::new();
    let mut page_number = 1;
    loop {
        let page = fetch_page(page_number).await?;
        let has_next = page.has_next();
        let page_items = page.into_items();
        debug!("Page {} returned {} items", page_number, page_items.len());
        items.extend(page_items);

        if !has_next {
            return Ok(items);
        }
        page_number += 1;
    }
}

#[allow(async_fn_in_trait)]
pub trait FplApi {
    async fn fixtures(&self) -> Result<Vec<Fixture>, FetchError>;

    async fn bootstrap(&self) -> Result<Bootstrap, FetchError>;

    async fn standings_page(&self, page: u32) -> Result<StandingsPage, FetchError>;

    async fn manager_picks(&self, entry: i64, gameweek: i64) -> Result<ManagerPicks, FetchError>;

    async fn transfers(&self, entry: i64) -> Result<Vec<Transfer>, FetchError>;
}

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    league_id: u64,
}

impl HttpApi {
    pub fn new<T>(base_url: T, league_id: u64) -> anyhow::Result<Self>
    where
        T: Into<String>,
    {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            league_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get<T>(&self, url: String, timeout: Duration) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        debug!("GET {}", url);
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.clone(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        trace!("Response from {}: {}", url, body);

        serde_json::from_str(&body).map_err(|e| FetchError::SchemaMismatch {
            url,
            message: e.to_string(),
        })
    }
}

impl FplApi for HttpApi {
    async fn fixtures(&self) -> Result<Vec<Fixture>, FetchError> {
        self.get(self.url("fixtures/"), SHORT_TIMEOUT).await
    }

    async fn bootstrap(&self) -> Result<Bootstrap, FetchError> {
        self.get(self.url("bootstrap-static/"), SHORT_TIMEOUT).await
    }

    async fn standings_page(&self, page: u32) -> Result<StandingsPage, FetchError> {
        let path = format!(
            "leagues-classic/{}/standings/?page_standings={}",
            self.league_id, page
        );
        self.get(self.url(&path), SHORT_TIMEOUT).await
    }

    async fn manager_picks(&self, entry: i64, gameweek: i64) -> Result<ManagerPicks, FetchError> {
        let path = format!("entry/{}/event/{}/picks/", entry, gameweek);
        self.get(self.url(&path), LONG_TIMEOUT).await
    }

    async fn transfers(&self, entry: i64) -> Result<Vec<Transfer>, FetchError> {
        let path = format!("entry/{}/transfers/", entry);
        self.get(self.url(&path), SHORT_TIMEOUT).await
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::model::{Standing, Standings};
    use anyhow::Result;
    use serde_json::Map;
    use std::cell::Cell;

    fn standings_page(first_entry: i64, rows: i64, has_next: bool) -> StandingsPage {
        StandingsPage {
            standings: Standings {
                has_next,
                results: (first_entry..first_entry + rows)
                    .map(|entry| Standing {
                        entry,
                        rest: Map::new(),
                    })
                    .collect(),
            },
        }
    }

    fn server_error() -> FetchError {
        FetchError::Status {
            url: "http://localhost/".to_string(),
            status: 503,
        }
    }

    fn no_backoff(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Vec::new(),
            retryable: FetchError::is_transient,
        }
    }

    #[tokio::test]
    async fn test_paginate_in_order_until_last_page() -> Result<()> {
        let pages = vec![
            standings_page(1, 50, true),
            standings_page(51, 50, true),
            standings_page(101, 7, false),
            standings_page(1000, 50, true),
        ];
        let requested = std::cell::RefCell::new(Vec::new());

        let items = paginate(|page: u32| {
            requested.borrow_mut().push(page);
            let result = pages[page as usize - 1].clone();
            async move { Ok(result) }
        })
        .await?;

        assert_eq!(vec![1, 2, 3], *requested.borrow());
        assert_eq!(107, items.len());
        let entries: Vec<i64> = items.iter().map(|s| s.entry).collect();
        assert_eq!((1..=107).collect::<Vec<_>>(), entries);

        Ok(())
    }

    #[tokio::test]
    async fn test_paginate_single_page() -> Result<()> {
        let items = paginate(|_| async { Ok(standings_page(1, 3, false)) }).await?;

        assert_eq!(3, items.len());

        Ok(())
    }

    #[tokio::test]
    async fn test_paginate_discards_partial_results() {
        let result = paginate(|page: u32| async move {
            if page < 3 {
                Ok(standings_page(page as i64 * 10, 10, true))
            } else {
                Err(server_error())
            }
        })
        .await;

        assert!(matches!(result, Err(FetchError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let calls = Cell::new(0);

        let result: Result<(), FetchError> = no_backoff(3)
            .run(|| {
                calls.set(calls.get() + 1);
                async { Err(server_error()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(3, calls.get());
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() -> Result<()> {
        let calls = Cell::new(0);

        let value = no_backoff(3)
            .run(|| {
                calls.set(calls.get() + 1);
                let attempt = calls.get();
                async move {
                    if attempt < 2 {
                        Err(server_error())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await?;

        assert_eq!(2, value);
        assert_eq!(2, calls.get());

        Ok(())
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_errors() {
        let calls = Cell::new(0);

        let result: Result<(), FetchError> = no_backoff(3)
            .run(|| {
                calls.set(calls.get() + 1);
                async {
                    Err(FetchError::SchemaMismatch {
                        url: "http://localhost/".to_string(),
                        message: "missing field `picks`".to_string(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(1, calls.get());
    }

    #[test]
    fn test_backoff_schedule_repeats_last_delay() {
        let policy = RetryPolicy::manager_picks();

        assert_eq!(None, policy.delay_before(1));
        assert_eq!(Some(Duration::from_secs(1)), policy.delay_before(2));
        assert_eq!(Some(Duration::from_secs(3)), policy.delay_before(3));
        assert_eq!(Some(Duration::from_secs(3)), policy.delay_before(4));
        assert_eq!(None, no_backoff(3).delay_before(2));
    }

    #[test]
    fn test_transient_errors() {
        let status = |status| FetchError::Status {
            url: String::new(),
            status,
        };

        assert!(status(500).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(
            FetchError::Transport {
                url: String::new(),
                message: "timed out".to_string()
            }
            .is_transient()
        );
    }

    #[tokio::test]
    async fn test_manager_picks_retry_not_found() {
        let policy = RetryPolicy {
            backoff: Vec::new(),
            ..RetryPolicy::manager_picks()
        };
        let calls = Cell::new(0);

        let result: Result<(), FetchError> = policy
            .run(|| {
                calls.set(calls.get() + 1);
                async {
                    Err(FetchError::Status {
                        url: "http://localhost/".to_string(),
                        status: 404,
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(3, calls.get());
        assert!(
            !FetchError::SchemaMismatch {
                url: String::new(),
                message: "missing field `picks`".to_string()
            }
            .is_request_failure()
        );
    }

    #[test]
    fn test_url_building() -> Result<()> {
        let api = HttpApi::new("https://example.com/api/", 123)?;

        assert_eq!("https://example.com/api/fixtures/", api.url("fixtures/"));

        Ok(())
    }
}
