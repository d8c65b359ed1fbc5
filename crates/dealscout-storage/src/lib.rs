//! HTTP fetch utilities + durable tabular record stores.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dealscout_core::FlagRecord;
use rand::Rng;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const CRATE_NAME: &str = "dealscout-storage";

const USER_AGENT_TEMPLATES: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.2420.81",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36 OPR/107.0.0.0",
];

/// Pool of rotating client identities, one picked at random per request.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    agents: Vec<String>,
}

impl IdentityPool {
    /// Sample `size` identities from the built-in templates.
    pub fn synthetic(size: usize) -> Self {
        let mut rng = rand::rng();
        let agents = (0..size.max(1))
            .map(|_| {
                let i = rng.random_range(0..USER_AGENT_TEMPLATES.len());
                USER_AGENT_TEMPLATES[i].to_string()
            })
            .collect();
        Self { agents }
    }

    pub fn from_agents(agents: Vec<String>) -> Self {
        let agents = if agents.is_empty() {
            vec![USER_AGENT_TEMPLATES[0].to_string()]
        } else {
            agents
        };
        Self { agents }
    }

    pub fn random(&self) -> &str {
        let i = rand::rng().random_range(0..self.agents.len());
        &self.agents[i]
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Response body plus the URL the request actually resolved to after
/// redirects. The pagination walker compares it against the requested URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub body: String,
    pub final_url: String,
}

/// Why a single fetch yielded no page. Every variant is a soft failure:
/// the request is logged and abandoned, never retried, so a blocked path
/// is not hammered.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("access denied (403) for {url}")]
    Blocked { url: String },
    #[error("rate limited (429) for {url}")]
    RateLimited { url: String },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("timeout fetching {url}")]
    Timeout { url: String },
    #[error("connection failure fetching {url}")]
    Connect { url: String },
    #[error("request error fetching {url}: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("reading body of {url}: {source}")]
    Body { url: String, source: reqwest::Error },
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub identity_pool_size: usize,
    /// Randomized politeness delay before each request, in milliseconds.
    pub delay_ms: std::ops::RangeInclusive<u64>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            identity_pool_size: 15,
            delay_ms: 1_000..=5_000,
        }
    }
}

/// Single-request page source over other people's servers.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    identities: IdentityPool,
    delay_ms: std::ops::RangeInclusive<u64>,
}

/// Seam between the pipeline and the network, so the walker and enricher can
/// be driven by in-memory pages in tests.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// One GET. `None` means the page is unavailable right now; the caller
    /// continues with its remaining work.
    async fn fetch_page(&self, url: &str) -> Option<FetchedPage>;
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            identities: IdentityPool::synthetic(config.identity_pool_size),
            delay_ms: config.delay_ms,
        })
    }

    async fn try_fetch(&self, url: &str) -> Result<FetchedPage, FetchFailure> {
        let (wait, agent) = {
            let mut rng = rand::rng();
            let wait = rng.random_range(self.delay_ms.clone());
            let i = rng.random_range(0..self.identities.len());
            (wait, self.identities.agents[i].clone())
        };
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }

        debug!(url, delay_ms = wait, "fetching page");
        let resp = match self.client.get(url).header(USER_AGENT, agent).send().await {
            Ok(resp) => resp,
            Err(err) if err.is_timeout() => {
                return Err(FetchFailure::Timeout { url: url.to_string() });
            }
            Err(err) if err.is_connect() => {
                return Err(FetchFailure::Connect { url: url.to_string() });
            }
            Err(err) => {
                return Err(FetchFailure::Request {
                    url: url.to_string(),
                    source: err,
                });
            }
        };

        let status = resp.status();
        let final_url = resp.url().to_string();
        if status == StatusCode::FORBIDDEN {
            return Err(FetchFailure::Blocked { url: final_url });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchFailure::RateLimited { url: final_url });
        }
        if !status.is_success() {
            return Err(FetchFailure::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.text().await.map_err(|source| FetchFailure::Body {
            url: final_url.clone(),
            source,
        })?;
        Ok(FetchedPage { body, final_url })
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch_page(&self, url: &str) -> Option<FetchedPage> {
        match self.try_fetch(url).await {
            Ok(page) => Some(page),
            Err(failure @ (FetchFailure::Blocked { .. } | FetchFailure::RateLimited { .. })) => {
                warn!("{failure}");
                None
            }
            Err(failure) => {
                error!("{failure}");
                None
            }
        }
    }
}

/// Ordered collection of flag-bearing records backed by one CSV file.
///
/// Writers always rewrite the whole file through a temp-file rename, so a
/// concurrent reader never observes a partial store.
#[derive(Debug)]
pub struct TableStore<R> {
    path: PathBuf,
    records: Vec<R>,
}

impl<R> TableStore<R>
where
    R: FlagRecord + Serialize + DeserializeOwned,
{
    /// Load the whole file into memory. A missing file is an empty store,
    /// not an error.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let records = Self::load_records(&path)?;
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn get(&self, index: usize) -> Option<&R> {
        self.records.get(index)
    }

    pub fn by_id(&self, id: &str) -> Option<&R> {
        let id = id.trim();
        self.records.iter().find(|r| r.id() == id)
    }

    fn load_records(path: &Path) -> anyhow::Result<Vec<R>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening store {}", path.display()))?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            let mut record: R =
                row.with_context(|| format!("parsing store row in {}", path.display()))?;
            record.canonicalize_id();
            records.push(record);
        }
        Ok(dedupe_by_id(records))
    }

    fn write_records(&self, records: &[R]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating store directory {}", parent.display()))?;
            }
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "store.csv".to_string());
        let temp_path = self.path.with_file_name(format!(".{file_name}.tmp"));

        let mut writer = csv::Writer::from_path(&temp_path)
            .with_context(|| format!("opening temp store {}", temp_path.display()))?;
        for record in records {
            writer
                .serialize(record)
                .with_context(|| format!("writing store row to {}", temp_path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing temp store {}", temp_path.display()))?;
        drop(writer);

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "atomically renaming temp store {} -> {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    /// Full rewrite of the backing file from the in-memory records.
    pub fn save(&self) -> anyhow::Result<()> {
        self.write_records(&self.records)
    }

    /// Discard the in-memory records and re-read the backing file.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        self.records = Self::load_records(&self.path)?;
        Ok(())
    }

    /// Merge a freshly scraped snapshot into the store.
    ///
    /// Persisted `spam`/`is_new` win for every id present on both sides; all
    /// other fields come from `fresh`. Rows only in the persisted store are
    /// dropped: a listing that vanished from the marketplace vanishes here
    /// too, without a tombstone. On any error the in-memory records are left
    /// untouched and nothing is persisted.
    pub fn reconcile(&mut self, fresh: Vec<R>) -> anyhow::Result<()> {
        let mut fresh: Vec<R> = fresh
            .into_iter()
            .map(|mut r| {
                r.canonicalize_id();
                r
            })
            .collect();
        fresh = dedupe_by_id(fresh);

        if self.records.is_empty() {
            self.write_records(&fresh)?;
            self.records = fresh;
            return Ok(());
        }

        let persisted = dedupe_by_id(self.records.clone());
        let flags: HashMap<String, (bool, bool)> = persisted
            .iter()
            .map(|r| (r.id().to_string(), (r.spam(), r.is_new())))
            .collect();
        for record in &mut fresh {
            if let Some((spam, is_new)) = flags.get(record.id()) {
                record.set_spam(*spam);
                record.set_is_new(*is_new);
            }
        }

        self.write_records(&fresh)?;
        debug!(
            persisted = persisted.len(),
            fresh = fresh.len(),
            "store reconciled"
        );
        self.records = fresh;
        Ok(())
    }

    pub fn add_to_spam(&mut self, index: usize) -> bool {
        match self.records.get_mut(index) {
            Some(record) => {
                record.set_spam(true);
                true
            }
            None => false,
        }
    }

    pub fn add_to_spam_by_id(&mut self, id: &str) -> bool {
        let id = id.trim();
        match self.records.iter_mut().find(|r| r.id() == id) {
            Some(record) => {
                record.set_spam(true);
                true
            }
            None => false,
        }
    }

    /// Sub-view excluding spam-marked rows. The store itself is unchanged;
    /// spam rows are logically excluded, never physically deleted.
    pub fn ignore_spam(&self) -> Vec<R> {
        self.records.iter().filter(|r| !r.spam()).cloned().collect()
    }

    pub fn mark_seen(&mut self, index: usize) -> bool {
        match self.records.get_mut(index) {
            Some(record) => {
                record.set_is_new(false);
                true
            }
            None => false,
        }
    }

    pub fn is_new(&self, index: usize) -> Option<bool> {
        self.records.get(index).map(|r| r.is_new())
    }

    /// Nearest non-spam row index starting at `start` and moving in
    /// `direction` (+1 / -1). Falls back to a full scan when the directed
    /// scan runs off the end, and to index 0 for an empty store. Supports
    /// forward/back navigation that skips spam rows.
    pub fn get_valid_index(&self, start: usize, direction: i64) -> usize {
        if self.records.is_empty() {
            return 0;
        }
        let len = self.records.len() as i64;
        let step = if direction < 0 { -1 } else { 1 };
        let mut i = start.min(self.records.len() - 1) as i64;
        while (0..len).contains(&i) {
            if !self.records[i as usize].spam() {
                return i as usize;
            }
            i += step;
        }
        self.records
            .iter()
            .position(|r| !r.spam())
            .unwrap_or(0)
    }
}

/// Stable first-occurrence-wins removal of rows sharing an id. Idempotent.
fn dedupe_by_id<R: FlagRecord>(records: Vec<R>) -> Vec<R> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.id().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealscout_core::ListingRecord;
    use tempfile::tempdir;

    fn record(id: &str, price: i64) -> ListingRecord {
        ListingRecord::new(id, format!("listing {id}"), format!("https://x/{id}"), price)
    }

    fn store_at(dir: &tempfile::TempDir) -> TableStore<ListingRecord> {
        TableStore::open(dir.path().join("listings.csv")).expect("open store")
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempdir().expect("tempdir");
        let store = store_at(&dir);
        assert!(store.is_empty());
        assert_eq!(store.get_valid_index(5, 1), 0);
    }

    #[test]
    fn save_then_open_round_trips_records() {
        let dir = tempdir().expect("tempdir");
        let mut store = store_at(&dir);
        let mut a = record("a1", 2500);
        a.ram = 16;
        a.category = "thinkpad x1 carbon".to_string();
        store
            .reconcile(vec![a.clone(), record("b2", 900)])
            .expect("reconcile");

        let reopened = store_at(&dir);
        assert_eq!(reopened.records(), store.records());
        assert_eq!(reopened.by_id("a1"), Some(&a));
    }

    #[test]
    fn reconcile_of_identical_snapshot_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let mut store = store_at(&dir);
        let snapshot = vec![record("a1", 100), record("b2", 200)];
        store.reconcile(snapshot.clone()).expect("first");
        let before = store.records().to_vec();
        store.reconcile(snapshot).expect("second");
        assert_eq!(store.records(), before.as_slice());
    }

    #[test]
    fn reconcile_preserves_flags_and_takes_fresh_fields() {
        let dir = tempdir().expect("tempdir");
        let mut store = store_at(&dir);
        store
            .reconcile(vec![record("a1", 100), record("b2", 200)])
            .expect("seed");
        store.add_to_spam_by_id("a1");
        store.mark_seen(1);
        store.save().expect("save flags");

        let mut fresh_a = record("a1", 150);
        fresh_a.spam = false;
        fresh_a.is_new = true;
        let mut fresh_b = record("b2", 250);
        fresh_b.is_new = true;
        store.reconcile(vec![fresh_a, fresh_b]).expect("merge");

        let a = store.by_id("a1").expect("a1");
        assert_eq!(a.price, 150, "non-flag fields come from fresh");
        assert!(a.spam, "persisted spam survives the re-scrape");
        let b = store.by_id("b2").expect("b2");
        assert_eq!(b.price, 250);
        assert!(!b.is_new, "persisted is_new survives the re-scrape");
    }

    #[test]
    fn reconcile_drops_rows_missing_from_fresh() {
        let dir = tempdir().expect("tempdir");
        let mut store = store_at(&dir);
        store
            .reconcile(vec![record("a1", 100), record("b2", 200)])
            .expect("seed");
        store.reconcile(vec![record("b2", 210)]).expect("merge");
        assert_eq!(store.len(), 1);
        assert!(store.by_id("a1").is_none(), "delisted row is gone");
    }

    #[test]
    fn reconcile_output_has_unique_ids() {
        let dir = tempdir().expect("tempdir");
        let mut store = store_at(&dir);
        store
            .reconcile(vec![record("a1", 100), record(" a1 ", 120), record("b2", 200)])
            .expect("merge");
        assert_eq!(store.len(), 2);
        assert_eq!(store.by_id("a1").expect("a1").price, 100, "first occurrence wins");
    }

    #[test]
    fn ignore_spam_is_exactly_the_non_spam_rows() {
        let dir = tempdir().expect("tempdir");
        let mut store = store_at(&dir);
        store
            .reconcile(vec![record("a1", 1), record("b2", 2), record("c3", 3)])
            .expect("seed");
        store.add_to_spam(1);

        let view = store.ignore_spam();
        assert_eq!(view.len(), 2);
        assert!(view.iter().all(|r| !r.spam));
        assert_eq!(store.len(), 3, "spam rows stay in the store");
    }

    #[test]
    fn valid_index_skips_spam_in_both_directions() {
        let dir = tempdir().expect("tempdir");
        let mut store = store_at(&dir);
        store
            .reconcile(vec![record("a", 1), record("b", 2), record("c", 3), record("d", 4)])
            .expect("seed");
        store.add_to_spam(1);
        store.add_to_spam(2);

        assert_eq!(store.get_valid_index(1, 1), 3);
        assert_eq!(store.get_valid_index(2, -1), 0);
        // directed scan exhausted -> full-store fallback
        store.add_to_spam(3);
        assert_eq!(store.get_valid_index(1, 1), 0);
    }

    #[test]
    fn dedupe_is_stable_and_idempotent() {
        let rows = vec![record("a", 1), record("b", 2), record("a", 3)];
        let once = dedupe_by_id(rows);
        assert_eq!(once.len(), 2);
        assert_eq!(once[0].price, 1);
        let twice = dedupe_by_id(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn identity_pool_always_yields_a_known_agent() {
        let pool = IdentityPool::synthetic(15);
        assert_eq!(pool.len(), 15);
        for _ in 0..32 {
            let agent = pool.random();
            assert!(agent.starts_with("Mozilla/5.0"));
        }
    }
}
