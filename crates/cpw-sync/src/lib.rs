//! Refresh pipeline: pagination, source fallback, diffing, single-flight
//! coordination and the periodic scheduler.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpw_core::{normalize, DiffResult, GameRecord, PriceChange, RecordKey};
use cpw_sources::{
    default_source_configs, source_for_config, Cursor, MarketConfig, Source, SourceConfig,
    SourceContext, SourceError,
};
use cpw_storage::{
    CacheEntry, CacheStore, HttpClientConfig, HttpFetcher, SnapshotCommit, SnapshotExporter,
    CATALOG_KEY,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpw-sync";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub market: MarketConfig,
    pub page_size: usize,
    pub max_pages: usize,
    pub cache_ttl: Duration,
    pub refresh_interval: Duration,
    pub refresh_cron: Option<String>,
    pub scheduler_enabled: bool,
    pub http_timeout_secs: u64,
    pub page_timeout: Duration,
    pub user_agent: String,
    pub source_override: Option<Vec<String>>,
    pub export_dir: Option<PathBuf>,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            workspace_root: text("CPW_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            market: MarketConfig::new(
                text("CPW_MARKET").unwrap_or_else(|| "AR".to_string()),
                text("CPW_LANGUAGE").unwrap_or_else(|| "es".to_string()),
            ),
            page_size: number("CPW_PAGE_SIZE", 100).max(1) as usize,
            max_pages: number("CPW_MAX_PAGES", 3).max(1) as usize,
            cache_ttl: Duration::from_secs(number("CPW_CACHE_TTL_SECS", 86_400)),
            refresh_interval: Duration::from_secs(number("CPW_REFRESH_INTERVAL_SECS", 43_200).max(1)),
            refresh_cron: text("CPW_REFRESH_CRON"),
            scheduler_enabled: lookup("CPW_SCHEDULER_ENABLED")
                .and_then(|v| parse_flag("CPW_SCHEDULER_ENABLED", &v))
                .unwrap_or(true),
            http_timeout_secs: number("CPW_HTTP_TIMEOUT_SECS", 30),
            page_timeout: Duration::from_secs(number("CPW_PAGE_TIMEOUT_SECS", 45).max(1)),
            user_agent: text("CPW_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            source_override: text("CPW_SOURCES").map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(ToString::to_string)
                    .collect()
            }),
            export_dir: text("CPW_EXPORT_DIR").map(PathBuf::from),
            web_port: lookup("CPW_WEB_PORT")
                .and_then(|v| v.trim().parse::<u16>().ok())
                .unwrap_or(3000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn paginator_config(&self) -> PaginatorConfig {
        PaginatorConfig {
            max_pages: self.max_pages,
            page_timeout: self.page_timeout,
        }
    }

    pub fn refresh_schedule(&self) -> RefreshSchedule {
        match &self.refresh_cron {
            Some(cron) => RefreshSchedule::Cron(cron.clone()),
            None => RefreshSchedule::Every(self.refresh_interval),
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(key, value = other, "unrecognized flag value, using default");
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: default_source_configs(),
        }
    }
}

impl SourceRegistry {
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no source registry file, using built-in sources");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn resolve(&self, override_ids: Option<&[String]>) -> Result<Vec<SourceConfig>> {
        let Some(ids) = override_ids else {
            return Ok(self.sources.iter().filter(|s| s.enabled).cloned().collect());
        };
        let builtin = default_source_configs();
        ids.iter()
            .map(|id| {
                let found = self
                    .sources
                    .iter()
                    .chain(builtin.iter())
                    .find(|s| &s.source_id == id)
                    .cloned();
                match found {
                    Some(mut config) => {
                        config.enabled = true;
                        Ok(config)
                    }
                    None => bail!("unknown source {id:?} in source override"),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginatorConfig {
    pub max_pages: usize,
    pub page_timeout: Duration,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            max_pages: 3,
            page_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exhausted,
    EmptyPage,
    PageLimit,
    CursorLoop,
    // non-empty page that added nothing new
    Stalled,
    Failed(SourceError),
}

impl Termination {
    pub fn is_natural(&self) -> bool {
        matches!(self, Termination::Exhausted | Termination::EmptyPage)
    }

    pub fn is_bounded(&self) -> bool {
        matches!(
            self,
            Termination::PageLimit | Termination::CursorLoop | Termination::Stalled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Termination::Exhausted => "exhausted",
            Termination::EmptyPage => "empty_page",
            Termination::PageLimit => "page_limit",
            Termination::CursorLoop => "cursor_loop",
            Termination::Stalled => "stalled",
            Termination::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pagination {
    pub records: Vec<GameRecord>,
    pub pages_fetched: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone, Default)]
pub struct Paginator {
    config: PaginatorConfig,
}

impl Paginator {
    pub fn new(config: PaginatorConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, source: &dyn Source) -> Pagination {
        let source_id = source.source_id().to_string();
        let max_pages = self.config.max_pages.max(1);

        let mut records = Vec::new();
        let mut seen_keys: HashSet<RecordKey> = HashSet::new();
        let mut visited: HashSet<Cursor> = HashSet::new();
        let mut cursor: Option<Cursor> = None;
        let mut pages_fetched = 0usize;
        let mut position = 0usize;

        let termination = loop {
            if pages_fetched >= max_pages {
                break Termination::PageLimit;
            }

            let fetched =
                tokio::time::timeout(self.config.page_timeout, source.fetch_page(cursor.as_ref())).await;
            let page = match fetched {
                Ok(Ok(page)) => page,
                Ok(Err(err)) => break Termination::Failed(err),
                Err(_) => {
                    break Termination::Failed(SourceError::Transient(format!(
                        "{source_id}: page {} timed out after {}s",
                        pages_fetched + 1,
                        self.config.page_timeout.as_secs_f32()
                    )))
                }
            };
            pages_fetched += 1;

            if page.items.is_empty() {
                break Termination::EmptyPage;
            }

            let before = records.len();
            for raw in &page.items {
                let record = normalize(raw, || format!("{source_id}:{position}"));
                position += 1;
                if seen_keys.insert(record.key()) {
                    records.push(record);
                }
            }
            let added = records.len() - before;
            debug!(source_id = %source_id, page = pages_fetched, items = page.items.len(), added, "page fetched");

            let Some(next) = page.next else {
                break Termination::Exhausted;
            };
            if added == 0 {
                break Termination::Stalled;
            }
            if !visited.insert(next.clone()) {
                break Termination::CursorLoop;
            }
            cursor = Some(next);
        };

        match &termination {
            Termination::Failed(err) => warn!(
                source_id = %source_id,
                pages_fetched,
                records = records.len(),
                error = %err,
                "pagination failed"
            ),
            other if other.is_bounded() => warn!(
                source_id = %source_id,
                pages_fetched,
                records = records.len(),
                termination = other.label(),
                "pagination stopped on a bound, snapshot may be incomplete"
            ),
            other => debug!(
                source_id = %source_id,
                pages_fetched,
                records = records.len(),
                termination = other.label(),
                "pagination finished"
            ),
        }

        Pagination {
            records,
            pages_fetched,
            termination,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAttempt {
    pub source_id: String,
    pub records: usize,
    pub pages: usize,
    pub termination: &'static str,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChainResolution {
    pub records: Vec<GameRecord>,
    pub source_id: Option<String>,
    pub complete: bool,
    pub attempts: Vec<SourceAttempt>,
}

pub struct FallbackChain {
    sources: Vec<Arc<dyn Source>>,
    paginator: Paginator,
}

impl FallbackChain {
    pub fn new(sources: Vec<Arc<dyn Source>>, paginator: Paginator) -> Self {
        Self { sources, paginator }
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.source_id().to_string()).collect()
    }

    pub async fn resolve(&self) -> ChainResolution {
        let mut attempts = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let pagination = self.paginator.run(source.as_ref()).await;
            let error = match &pagination.termination {
                Termination::Failed(err) => Some(err.to_string()),
                _ => None,
            };
            attempts.push(SourceAttempt {
                source_id: source.source_id().to_string(),
                records: pagination.records.len(),
                pages: pagination.pages_fetched,
                termination: pagination.termination.label(),
                error,
            });

            if !pagination.records.is_empty() {
                info!(
                    source_id = source.source_id(),
                    records = pagination.records.len(),
                    complete = pagination.termination.is_natural(),
                    "source resolved"
                );
                return ChainResolution {
                    records: pagination.records,
                    source_id: Some(source.source_id().to_string()),
                    complete: pagination.termination.is_natural(),
                    attempts,
                };
            }
            info!(source_id = source.source_id(), "source yielded nothing, falling back");
        }

        ChainResolution {
            attempts,
            ..Default::default()
        }
    }
}

/// Output follows `next` order.
pub fn diff(previous: Option<&[GameRecord]>, next: &[GameRecord]) -> DiffResult {
    let Some(previous) = previous else {
        return DiffResult {
            new_records: next.to_vec(),
            price_changes: Vec::new(),
        };
    };

    let mut lookup: HashMap<RecordKey, &GameRecord> = HashMap::with_capacity(previous.len());
    for record in previous {
        lookup.entry(record.key()).or_insert(record);
    }

    let mut result = DiffResult::default();
    for record in next {
        match lookup.get(&record.key()) {
            None => result.new_records.push(record.clone()),
            Some(old) if old.price != record.price => result.price_changes.push(PriceChange {
                id: record.id.clone(),
                name: record.name.clone(),
                link: record.link.clone(),
                old_price: old.price.clone(),
                new_price: record.price.clone(),
            }),
            Some(_) => {}
        }
    }
    result
}

#[async_trait]
pub trait SnapshotHook: Send + Sync {
    async fn after_commit(&self, key: &str, entry: &CacheEntry) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopSnapshotHook;

#[async_trait]
impl SnapshotHook for NoopSnapshotHook {
    async fn after_commit(&self, _key: &str, _entry: &CacheEntry) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExportSnapshotHook {
    exporter: SnapshotExporter,
}

impl ExportSnapshotHook {
    pub fn new(exporter: SnapshotExporter) -> Self {
        Self { exporter }
    }
}

#[async_trait]
impl SnapshotHook for ExportSnapshotHook {
    async fn after_commit(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let exported = self.exporter.export(key, entry).await?;
        info!(
            path = %exported.absolute_path.display(),
            bytes = exported.byte_size,
            deduplicated = exported.deduplicated,
            "snapshot exported"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Fetching,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Committed {
        source_id: String,
        total: usize,
        new_records: usize,
        price_changes: usize,
        complete: bool,
    },
    Exhausted,
    AlreadyInFlight,
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub outcome: RefreshOutcome,
    pub attempts: Vec<SourceAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub state: RefreshState,
    pub sources: Vec<String>,
    pub last_cycle: Option<CycleReport>,
}

pub struct RefreshCoordinator {
    chain: FallbackChain,
    cache: Arc<CacheStore>,
    key: String,
    hook: Arc<dyn SnapshotHook>,
    state: Mutex<RefreshState>,
    state_tx: watch::Sender<RefreshState>,
    last_cycle: Mutex<Option<CycleReport>>,
    stale_marker: Mutex<Option<StaleMarker>>,
}

#[derive(Debug, Clone, Copy)]
struct StaleMarker {
    fetched_at: DateTime<Utc>,
    triggered_at: DateTime<Utc>,
}

/// Held for the duration of one cycle; dropping it (including during a
/// panic unwind) puts the coordinator back to `Idle`.
struct FetchGuard {
    coordinator: Arc<RefreshCoordinator>,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.coordinator.set_state(RefreshState::Idle);
    }
}

impl RefreshCoordinator {
    pub fn new(chain: FallbackChain, cache: Arc<CacheStore>, key: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(RefreshState::Idle);
        Self {
            chain,
            cache,
            key: key.into(),
            hook: Arc::new(NoopSnapshotHook),
            state: Mutex::new(RefreshState::Idle),
            state_tx,
            last_cycle: Mutex::new(None),
            stale_marker: Mutex::new(None),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SnapshotHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> RefreshState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.last_cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            state: self.state(),
            sources: self.chain.source_ids(),
            last_cycle: self.last_cycle(),
        }
    }

    fn set_state(&self, next: RefreshState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        self.state_tx.send_replace(next);
    }

    fn try_begin(self: &Arc<Self>) -> Option<FetchGuard> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == RefreshState::Fetching {
                return None;
            }
            *state = RefreshState::Fetching;
        }
        self.state_tx.send_replace(RefreshState::Fetching);
        Some(FetchGuard {
            coordinator: Arc::clone(self),
        })
    }

    fn spawn_cycle(self: &Arc<Self>, guard: FetchGuard) -> (Uuid, JoinHandle<RefreshOutcome>) {
        let cycle_id = Uuid::new_v4();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.run_cycle(cycle_id).await
        });
        (cycle_id, handle)
    }

    pub fn trigger_refresh(self: &Arc<Self>) -> bool {
        let Some(guard) = self.try_begin() else {
            debug!(key = %self.key, "refresh already in flight");
            return false;
        };
        let (cycle_id, handle) = self.spawn_cycle(guard);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.settle(cycle_id, handle).await;
        });
        true
    }

    pub async fn refresh_now(self: &Arc<Self>) -> RefreshOutcome {
        let Some(guard) = self.try_begin() else {
            return RefreshOutcome::AlreadyInFlight;
        };
        let (cycle_id, handle) = self.spawn_cycle(guard);
        self.settle(cycle_id, handle).await
    }

    /// Trigger a background refresh for an expired entry, at most once per
    /// entry within each further `ttl` window.
    pub fn trigger_if_stale(self: &Arc<Self>, entry: &CacheEntry) -> bool {
        self.trigger_if_stale_at(entry, Utc::now())
    }

    fn trigger_if_stale_at(self: &Arc<Self>, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        if !entry.is_expired_at(now) {
            return false;
        }
        {
            let mut marker = self.stale_marker.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(prev) = *marker {
                let window_open = (now - prev.triggered_at)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= self.cache.ttl());
                if prev.fetched_at == entry.fetched_at && !window_open {
                    return false;
                }
            }
            *marker = Some(StaleMarker {
                fetched_at: entry.fetched_at,
                triggered_at: now,
            });
        }
        info!(key = %self.key, fetched_at = %entry.fetched_at, "serving stale entry, refreshing in background");
        self.trigger_refresh()
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == RefreshState::Idle).await;
    }

    async fn settle(&self, cycle_id: Uuid, handle: JoinHandle<RefreshOutcome>) -> RefreshOutcome {
        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%cycle_id, error = %err, "refresh cycle aborted");
                let outcome = RefreshOutcome::Failed {
                    message: format!("refresh cycle aborted: {err}"),
                };
                self.record(cycle_id, outcome.clone(), Vec::new());
                outcome
            }
        }
    }

    fn record(&self, cycle_id: Uuid, outcome: RefreshOutcome, attempts: Vec<SourceAttempt>) {
        *self.last_cycle.lock().unwrap_or_else(PoisonError::into_inner) = Some(CycleReport {
            cycle_id,
            finished_at: Utc::now(),
            outcome,
            attempts,
        });
    }

    async fn run_cycle(&self, cycle_id: Uuid) -> RefreshOutcome {
        let span = info_span!("refresh_cycle", %cycle_id, key = %self.key);
        async {
            info!("refresh cycle started");
            let ChainResolution {
                records,
                source_id,
                complete,
                attempts,
            } = self.chain.resolve().await;

            let outcome = if records.is_empty() {
                warn!(attempts = attempts.len(), "every source came back empty, keeping cached snapshot");
                RefreshOutcome::Exhausted
            } else {
                let previous = self.cache.get(&self.key).await;
                let diff = diff(previous.as_deref().map(|e| e.snapshot.as_slice()), &records);
                let source_id = source_id.unwrap_or_default();
                let entry = self
                    .cache
                    .set(
                        &self.key,
                        SnapshotCommit {
                            snapshot: records,
                            diff,
                            source_id: source_id.clone(),
                            complete,
                        },
                    )
                    .await;
                if let Err(err) = self.hook.after_commit(&self.key, &entry).await {
                    warn!(error = %format!("{err:#}"), "post-commit hook failed");
                }
                info!(
                    source_id = %source_id,
                    total = entry.snapshot.len(),
                    new_records = entry.diff.new_records.len(),
                    price_changes = entry.diff.price_changes.len(),
                    complete,
                    "snapshot committed"
                );
                RefreshOutcome::Committed {
                    source_id,
                    total: entry.snapshot.len(),
                    new_records: entry.diff.new_records.len(),
                    price_changes: entry.diff.price_changes.len(),
                    complete,
                }
            };
            self.record(cycle_id, outcome.clone(), attempts);
            outcome
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshSchedule {
    Every(Duration),
    Cron(String),
}

fn scheduled_tick(coordinator: &Arc<RefreshCoordinator>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let coordinator = Arc::clone(coordinator);
    Box::pin(async move {
        if !coordinator.trigger_refresh() {
            debug!("scheduled refresh skipped, cycle already running");
        }
    })
}

pub struct RefreshScheduler {
    sched: JobScheduler,
}

impl RefreshScheduler {
    pub async fn start(coordinator: Arc<RefreshCoordinator>, schedule: RefreshSchedule) -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let job = match &schedule {
            RefreshSchedule::Every(interval) => {
                let coordinator = Arc::clone(&coordinator);
                Job::new_repeated_async(*interval, move |_uuid, _l| scheduled_tick(&coordinator))
                    .with_context(|| format!("creating refresh job every {interval:?}"))?
            }
            RefreshSchedule::Cron(cron) => {
                let coordinator = Arc::clone(&coordinator);
                Job::new_async(cron, move |_uuid, _l| scheduled_tick(&coordinator))
                    .with_context(|| format!("creating refresh job for cron {cron}"))?
            }
        };
        sched.add(job).await.context("adding refresh job")?;
        sched.start().await.context("starting scheduler")?;
        info!(?schedule, "refresh scheduler started");

        coordinator.trigger_refresh();
        Ok(Self { sched })
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.sched.shutdown().await.context("stopping scheduler")?;
        info!("refresh scheduler stopped");
        Ok(())
    }
}

pub struct CatalogRuntime {
    pub config: SyncConfig,
    pub sources: Vec<SourceConfig>,
    pub cache: Arc<CacheStore>,
    pub coordinator: Arc<RefreshCoordinator>,
}

impl CatalogRuntime {
    pub async fn build(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.workspace_root).await?;
        let sources = registry.resolve(config.source_override.as_deref())?;
        if sources.is_empty() {
            bail!("no enabled sources configured");
        }

        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let ctx = SourceContext {
            http,
            market: config.market.clone(),
            page_size: config.page_size,
        };
        let chain_sources = sources
            .iter()
            .map(|s| source_for_config(s, &ctx))
            .collect::<Result<Vec<_>>>()?;
        let chain = FallbackChain::new(chain_sources, Paginator::new(config.paginator_config()));

        let cache = Arc::new(CacheStore::new(config.cache_ttl));
        let hook: Arc<dyn SnapshotHook> = match &config.export_dir {
            Some(dir) => Arc::new(ExportSnapshotHook::new(SnapshotExporter::new(dir.clone()))),
            None => Arc::new(NoopSnapshotHook),
        };
        let coordinator =
            Arc::new(RefreshCoordinator::new(chain, Arc::clone(&cache), CATALOG_KEY).with_hook(hook));

        info!(
            sources = ?sources.iter().map(|s| s.source_id.as_str()).collect::<Vec<_>>(),
            market = %config.market.locale(),
            max_pages = config.max_pages,
            "catalog runtime ready"
        );
        Ok(Self {
            config,
            sources,
            cache,
            coordinator,
        })
    }

    pub async fn start_scheduler(&self) -> Result<Option<RefreshScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let scheduler =
            RefreshScheduler::start(Arc::clone(&self.coordinator), self.config.refresh_schedule()).await?;
        Ok(Some(scheduler))
    }

    pub async fn current_entry(&self) -> Option<Arc<CacheEntry>> {
        self.cache.get(self.coordinator.key()).await
    }
}

pub async fn build_runtime_from_env() -> Result<CatalogRuntime> {
    CatalogRuntime::build(SyncConfig::from_env()).await
}

pub async fn run_refresh_once_from_env() -> Result<(CatalogRuntime, RefreshOutcome)> {
    let runtime = build_runtime_from_env().await?;
    let outcome = runtime.coordinator.refresh_now().await;
    Ok((runtime, outcome))
}
