//! Scrape -> reconcile -> analyze pipeline orchestration.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dealscout_core::{DealRecord, ListingRecord, ListingSummary, UNKNOWN_CATEGORY};
use dealscout_scrape::{
    categorize, clean_title, dedupe_by_key, is_spam, normalize_price, parse_catalog_page,
    parse_detail_page, site_origin, ListingDetails, SelectorMap,
};
use dealscout_storage::{FetcherConfig, PageFetcher, PageSource, TableStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealscout-pipeline";

/// Hard cap on catalog pages walked per model.
const PAGE_CAP: usize = 25;
/// Cohort size a listing's reference group must exceed before its median
/// is considered statistically meaningful.
const COHORT_FLOOR: usize = 4;
/// Extra sleep after a failed cycle before the scheduler is allowed to fire
/// again.
const EXTENDED_BACKOFF: Duration = Duration::from_secs(60);

fn default_interval() -> u64 {
    30
}

fn default_workers() -> usize {
    6
}

/// Immutable per-run pipeline configuration, loaded from a YAML document.
/// Target models and blacklist terms are serialized as ordered lists and
/// reconstructed as sets; both are lowercased on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub models: BTreeSet<String>,
    pub blacklist: BTreeSet<String>,
    pub min_deal_score: f64,
    pub max_deal_score: f64,
    #[serde(default = "default_interval")]
    pub check_interval_minutes: u64,
    pub catalog_url: String,
    pub selectors: BTreeMap<String, String>,
    #[serde(default = "default_workers")]
    pub model_workers: usize,
    #[serde(default = "default_workers")]
    pub detail_workers: usize,
    /// Notification-channel identifiers, owned by the presentation layer.
    #[serde(default)]
    pub notify_token: String,
    #[serde(default)]
    pub notify_chat_id: String,
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.models = config.models.iter().map(|m| m.to_lowercase()).collect();
        config.blacklist = config.blacklist.iter().map(|b| b.to_lowercase()).collect();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.min_deal_score) || !(0.0..1.0).contains(&self.max_deal_score)
        {
            bail!(
                "deal score range [{}, {}] must lie in (0, 1)",
                self.min_deal_score,
                self.max_deal_score
            );
        }
        if self.min_deal_score > self.max_deal_score {
            bail!(
                "min_deal_score {} exceeds max_deal_score {}",
                self.min_deal_score,
                self.max_deal_score
            );
        }
        if self.catalog_url.is_empty() {
            bail!("catalog_url must not be empty");
        }
        Ok(())
    }
}

/// Process-level settings, environment-driven like the rest of the
/// deployment surface.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub http_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("DEALSCOUT_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config.yaml")),
            data_dir: std::env::var("DEALSCOUT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            http_timeout_secs: std::env::var("DEALSCOUT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }

    pub fn listing_store_path(&self) -> PathBuf {
        self.data_dir.join("listings.csv")
    }

    pub fn deals_store_path(&self) -> PathBuf {
        self.data_dir.join("hot_deals.csv")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub models: usize,
    pub raw_listings: usize,
    pub cleaned_listings: usize,
    pub enriched_listings: usize,
    pub store_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listings_considered: usize,
    pub hot_deals: usize,
    pub new_deals: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub scrape: ScrapeRunSummary,
    /// Absent when the scrape found nothing worth analyzing.
    pub analysis: Option<AnalysisRunSummary>,
}

/// Walk one model's catalog pagination sequentially.
///
/// Stops when a page parses to zero cards, or when a page past the first
/// resolves to a different URL than requested (the site redirected away,
/// which marks the end of results); a redirected page's results are not
/// kept. A failed fetch skips that page and continues with the next.
pub async fn walk_model(
    source: &dyn PageSource,
    selectors: &SelectorMap,
    catalog_url: &str,
    model: &str,
) -> Vec<ListingSummary> {
    let origin = site_origin(catalog_url);
    let mut collected = Vec::new();
    info!(model, "model walk started");

    for page in 1..=PAGE_CAP {
        let url = format!("{}{}/?page={}", catalog_url, model.replace(' ', "%20"), page);
        let Some(fetched) = source.fetch_page(&url).await else {
            warn!(model, page, "page unavailable, skipping");
            continue;
        };
        let items = parse_catalog_page(&fetched.body, selectors, &origin);
        if items.is_empty() || (page > 1 && fetched.final_url != url) {
            info!(model, page, "end of results");
            break;
        }
        info!(model, page, count = items.len(), "page parsed");
        collected.extend(items);
    }

    collected
}

/// Turn raw summaries into listing records: price normalized exactly once,
/// category from the cleaned catalog title, blacklist hits flagged as spam.
/// Spam rows are flagged rather than dropped; active views exclude them.
pub fn clean_listings(summaries: Vec<ListingSummary>, config: &PipelineConfig) -> Vec<ListingRecord> {
    let mut records = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let cleaned = clean_title(&summary.title);
        let mut record = ListingRecord::new(
            summary.id,
            summary.title,
            summary.link,
            normalize_price(&summary.raw_price),
        );
        record.category = categorize(&cleaned, &config.models);
        record.spam = is_spam(&cleaned, &config.blacklist);
        records.push(record);
    }
    records
}

/// Merge enrichment results into the cleaned summary rows by id.
/// Enrichment wins for every field it extracts except `title` and `price`,
/// which the summary pass retains as authoritative.
pub fn merge_details(
    mut records: Vec<ListingRecord>,
    details: Vec<ListingDetails>,
) -> Vec<ListingRecord> {
    let by_id: HashMap<String, ListingDetails> =
        details.into_iter().map(|d| (d.id.clone(), d)).collect();
    for record in &mut records {
        if let Some(detail) = by_id.get(&record.id) {
            record.category = detail.category.clone();
            record.place = detail.place.clone();
            record.date = detail.date.clone();
            record.image_link = detail.image_link.clone();
            record.description = detail.description.clone();
            record.ram = detail.ram;
            record.cpu = detail.cpu.clone();
            record.disk_capacity = detail.disk_capacity;
        }
    }
    records
}

fn median(prices: &[i64]) -> f64 {
    let mut sorted = prices.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    }
}

/// Cohort-based outlier scoring over the listing store.
///
/// Listings are grouped by (category, ram, disk capacity); a cohort's
/// median is trusted only past the significance floor. Retained deals are
/// marked fresh and ordered best-first.
pub fn find_hot_deals(listings: &[ListingRecord], config: &PipelineConfig) -> Vec<DealRecord> {
    let candidates: Vec<&ListingRecord> = listings
        .iter()
        .filter(|r| !r.spam && r.category != UNKNOWN_CATEGORY && r.price > 0)
        .collect();

    let mut cohorts: HashMap<(&str, u32, u32), Vec<i64>> = HashMap::new();
    for record in &candidates {
        cohorts
            .entry((record.category.as_str(), record.ram, record.disk_capacity))
            .or_default()
            .push(record.price);
    }
    let stats: HashMap<(&str, u32, u32), (f64, u32)> = cohorts
        .into_iter()
        .map(|(key, prices)| (key, (median(&prices), prices.len() as u32)))
        .collect();

    let mut deals = Vec::new();
    for record in candidates {
        let key = (record.category.as_str(), record.ram, record.disk_capacity);
        let Some(&(cohort_median, cohort_count)) = stats.get(&key) else {
            continue;
        };
        if (cohort_count as usize) <= COHORT_FLOOR {
            continue;
        }
        let deal_score = 1.0 - record.price as f64 / cohort_median;
        if deal_score < config.min_deal_score || deal_score > config.max_deal_score {
            continue;
        }
        let mut listing = record.clone();
        listing.is_new = true;
        deals.push(DealRecord::from_listing(
            listing,
            cohort_median,
            cohort_count,
            deal_score,
        ));
    }

    deals.sort_by(|a, b| {
        b.deal_score
            .partial_cmp(&a.deal_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.category.cmp(&a.category))
    });
    deals
}

/// The whole ingestion -> reconciliation -> analysis pipeline, sharing one
/// page source and one run lock.
pub struct Pipeline {
    runtime: RuntimeConfig,
    config: Arc<PipelineConfig>,
    selectors: Arc<SelectorMap>,
    source: Arc<dyn PageSource>,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(runtime: RuntimeConfig) -> Result<Self> {
        let config = PipelineConfig::load(&runtime.config_path)?;
        let selectors = SelectorMap::from_locators(&config.selectors)?;
        let source = Arc::new(PageFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(runtime.http_timeout_secs),
            ..FetcherConfig::default()
        })?);
        Ok(Self {
            runtime,
            config: Arc::new(config),
            selectors: Arc::new(selectors),
            source,
            run_lock: Mutex::new(()),
        })
    }

    /// Swap the network out for another page source (tests use in-memory
    /// fixtures).
    pub fn with_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// One full cycle (scrape, then analyze) under the run lock. Returns
    /// `None` when another run is already in flight: overlapping triggers
    /// are rejected, never interleaved against the same stores.
    pub async fn try_run_cycle(&self) -> Result<Option<CycleSummary>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("a pipeline run is already in flight; trigger rejected");
            return Ok(None);
        };

        let scrape = self.scrape_once().await?;
        let analysis = if scrape.cleaned_listings == 0 {
            warn!("scrape yielded no listings; skipping analysis");
            None
        } else {
            Some(self.analyze_once()?)
        };

        let cycle = CycleSummary { scrape, analysis };
        if let Err(err) = self.write_report(&cycle).await {
            warn!("writing run report failed: {err:#}");
        }
        Ok(Some(cycle))
    }

    /// Scrape every target model and reconcile the merged snapshot into the
    /// listing store. An empty harvest leaves the store untouched rather
    /// than wiping it.
    pub async fn scrape_once(&self) -> Result<ScrapeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, models = self.config.models.len(), "scrape run started");

        let summaries = self.collect_summaries().await;
        let raw_listings = summaries.len();
        if summaries.is_empty() {
            warn!("no listings found for any target model");
            return Ok(ScrapeRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                models: self.config.models.len(),
                raw_listings: 0,
                cleaned_listings: 0,
                enriched_listings: 0,
                store_size: 0,
            });
        }

        let cleaned = clean_listings(summaries, &self.config);
        let cleaned_listings = cleaned.len();
        let details = self.enrich_listings(&cleaned).await;
        let enriched_listings = details.len();
        let merged = merge_details(cleaned, details);

        let mut store = TableStore::<ListingRecord>::open(self.runtime.listing_store_path())?;
        store
            .reconcile(merged)
            .context("reconciling listing store")?;

        let summary = ScrapeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            models: self.config.models.len(),
            raw_listings,
            cleaned_listings,
            enriched_listings,
            store_size: store.len(),
        };
        info!(
            %run_id,
            raw = summary.raw_listings,
            stored = summary.store_size,
            "scrape run finished"
        );
        Ok(summary)
    }

    /// Recompute the hot-deals store from the persisted listings. Any
    /// failure aborts with no partial hot-deals write; the previous store
    /// file survives.
    pub fn analyze_once(&self) -> Result<AnalysisRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let listings = TableStore::<ListingRecord>::open(self.runtime.listing_store_path())?;
        let deals = find_hot_deals(listings.records(), &self.config);
        let hot_deals = deals.len();

        let mut store = TableStore::<DealRecord>::open(self.runtime.deals_store_path())?;
        store.reconcile(deals).context("reconciling hot-deals store")?;
        let new_deals = store.records().iter().filter(|d| d.is_new).count();

        info!(%run_id, hot_deals, new_deals, "analysis run finished");
        Ok(AnalysisRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            listings_considered: listings.len(),
            hot_deals,
            new_deals,
        })
    }

    /// Fan the model walks out over a bounded worker pool; page fetching
    /// inside one walk stays sequential for per-model pacing. The combined
    /// harvest is deduplicated by id, first occurrence wins.
    async fn collect_summaries(&self) -> Vec<ListingSummary> {
        let limit = Arc::new(Semaphore::new(self.config.model_workers.max(1)));
        let mut tasks = JoinSet::new();
        for model in self.config.models.iter().cloned() {
            let source = self.source.clone();
            let selectors = self.selectors.clone();
            let config = self.config.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                walk_model(source.as_ref(), &selectors, &config.catalog_url, &model).await
            });
        }

        let mut all = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(items) => all.extend(items),
                Err(err) => error!("model walk task failed: {err}"),
            }
        }
        dedupe_by_key(all, |s: &ListingSummary| s.id.clone())
    }

    /// Fetch and parse every listing's detail page on a bounded pool.
    /// Failures drop out of the result set entirely.
    async fn enrich_listings(&self, records: &[ListingRecord]) -> Vec<ListingDetails> {
        let limit = Arc::new(Semaphore::new(self.config.detail_workers.max(1)));
        let mut tasks = JoinSet::new();
        for link in records.iter().map(|r| r.link.clone()) {
            let source = self.source.clone();
            let selectors = self.selectors.clone();
            let config = self.config.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let page = source.fetch_page(&link).await?;
                parse_detail_page(&page.body, &link, &selectors, &config.models)
            });
        }

        let mut details = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(detail)) => details.push(detail),
                Ok(None) => {}
                Err(err) => error!("detail fetch task failed: {err}"),
            }
        }
        dedupe_by_key(details, |d: &ListingDetails| d.id.clone())
    }

    async fn write_report(&self, cycle: &CycleSummary) -> Result<PathBuf> {
        let reports_dir = self.runtime.reports_dir();
        tokio::fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let path = reports_dir.join(format!("{}.json", cycle.scrape.run_id));
        let bytes = serde_json::to_vec_pretty(cycle).context("serializing run report")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Periodic trigger for the pipeline. One repeated job per interval; a tick
/// that lands while a run is in flight is rejected by the run lock, and a
/// failed cycle earns an extended backoff sleep before the next attempt.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<JobScheduler> {
    let interval =
        Duration::from_secs(pipeline.config.check_interval_minutes.max(1) * 60);
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let job = Job::new_repeated_async(interval, move |_id, _sched| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.try_run_cycle().await {
                Ok(Some(cycle)) => {
                    info!(
                        stored = cycle.scrape.store_size,
                        hot_deals = cycle.analysis.as_ref().map(|a| a.hot_deals).unwrap_or(0),
                        "scheduled cycle finished"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    error!("scheduled cycle failed: {err:#}");
                    tokio::time::sleep(EXTENDED_BACKOFF).await;
                }
            }
        })
    })
    .context("creating repeated pipeline job")?;
    sched.add(job).await.context("adding pipeline job")?;
    Ok(sched)
}

/// Run one cycle immediately, then keep cycling on the configured interval
/// until ctrl-c.
pub async fn run_daemon(pipeline: Arc<Pipeline>) -> Result<()> {
    if let Err(err) = pipeline.try_run_cycle().await {
        error!("initial cycle failed: {err:#}");
        tokio::time::sleep(EXTENDED_BACKOFF).await;
    }

    let mut sched = build_scheduler(pipeline.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(
        interval_minutes = pipeline.config.check_interval_minutes,
        "scheduler started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
