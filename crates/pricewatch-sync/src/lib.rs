//! Price watch run orchestration: classify observations against history and compose notifications.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, SubsecRound, Utc};
use pricewatch_adapters::{FetchContext, FixturePriceSource, PriceSource, SteamStoreSource};
use pricewatch_core::{
    ChangeEvent, ChangeKind, PriceMovement, PriceRecord, PriceState, TrackedItem,
};
use pricewatch_storage::{
    encode_record, most_recent_for_item, HistoryStore, HttpClientConfig, HttpFetcher,
    NotificationArtifact, RunLock, DEFAULT_LOCK_STALE_AFTER, DEFAULT_MAX_RECORDS,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-sync";

pub const DEFAULT_STORE_LINK: &str = "https://store.steampowered.com/";

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub items: Vec<TrackedItem>,
    pub market: String,
    pub max_records: usize,
    pub history_path: PathBuf,
    pub notification_path: PathBuf,
    pub lock_path: Option<PathBuf>,
    /// A lock file older than this is taken over instead of blocking the run.
    pub lock_stale_after_secs: u64,
    pub fixtures_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub store_link: Option<String>,
}

impl WatchConfig {
    pub fn new(items: Vec<TrackedItem>) -> Self {
        Self {
            items,
            market: "cn".to_string(),
            max_records: DEFAULT_MAX_RECORDS,
            history_path: PathBuf::from("price_log.txt"),
            notification_path: PathBuf::from("result.md"),
            lock_path: None,
            lock_stale_after_secs: DEFAULT_LOCK_STALE_AFTER.as_secs(),
            fixtures_dir: None,
            http_timeout_secs: 10,
            user_agent: "pricewatch/0.1".to_string(),
            store_link: Some(DEFAULT_STORE_LINK.to_string()),
        }
    }

    pub fn from_env() -> Result<Self> {
        let watchlist_path = std::env::var("PRICEWATCH_WATCHLIST")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("watchlist.yaml"));
        let items = load_watchlist(&watchlist_path)?;

        let max_records = positive_setting(
            "PRICEWATCH_MAX_RECORDS",
            std::env::var("PRICEWATCH_MAX_RECORDS").ok(),
            DEFAULT_MAX_RECORDS,
        )?;
        let http_timeout_secs = positive_setting(
            "PRICEWATCH_HTTP_TIMEOUT_SECS",
            std::env::var("PRICEWATCH_HTTP_TIMEOUT_SECS").ok(),
            10,
        )?;
        let lock_stale_after_secs = positive_setting(
            "PRICEWATCH_LOCK_STALE_SECS",
            std::env::var("PRICEWATCH_LOCK_STALE_SECS").ok(),
            DEFAULT_LOCK_STALE_AFTER.as_secs(),
        )?;

        Ok(Self {
            items,
            market: std::env::var("PRICEWATCH_MARKET").unwrap_or_else(|_| "cn".to_string()),
            max_records,
            history_path: history_path_from_env(),
            notification_path: std::env::var("PRICEWATCH_NOTIFICATION_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("result.md")),
            lock_path: std::env::var("PRICEWATCH_LOCK_FILE").ok().map(PathBuf::from),
            lock_stale_after_secs,
            fixtures_dir: std::env::var("PRICEWATCH_FIXTURES_DIR").ok().map(PathBuf::from),
            http_timeout_secs,
            user_agent: std::env::var("PRICEWATCH_USER_AGENT")
                .unwrap_or_else(|_| "pricewatch/0.1".to_string()),
            store_link: Some(
                std::env::var("PRICEWATCH_STORE_LINK")
                    .unwrap_or_else(|_| DEFAULT_STORE_LINK.to_string()),
            )
            .filter(|link| !link.trim().is_empty()),
        })
    }
}

/// Parses a numeric setting that must be at least 1; unset means `default`.
fn positive_setting<T>(name: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr + PartialEq + From<u8>,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .with_context(|| format!("parsing {name}={raw:?}"))?;
    if value == T::from(0) {
        bail!("{name} must be greater than 0");
    }
    Ok(value)
}

pub fn history_path_from_env() -> PathBuf {
    std::env::var("PRICEWATCH_HISTORY_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("price_log.txt"))
}

#[derive(Debug, Clone, Deserialize)]
struct WatchlistFile {
    #[serde(default)]
    items: Vec<WatchlistEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct WatchlistEntry {
    id: WatchlistId,
    #[serde(default)]
    label: Option<String>,
}

/// App ids are numeric on Steam, so YAML hands them over as integers unless quoted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WatchlistId {
    Number(u64),
    Text(String),
}

impl WatchlistId {
    fn into_string(self) -> String {
        match self {
            WatchlistId::Number(n) => n.to_string(),
            WatchlistId::Text(s) => s.trim().to_string(),
        }
    }
}

pub fn load_watchlist(path: &Path) -> Result<Vec<TrackedItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_watchlist(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Parse `{ items: [ { id, label? } ] }`, dropping duplicate ids.
pub fn parse_watchlist(text: &str) -> Result<Vec<TrackedItem>> {
    let file: WatchlistFile = serde_yaml::from_str(text)?;
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for entry in file.items {
        let id = entry.id.into_string();
        if id.is_empty() {
            bail!("watchlist entry with an empty id");
        }
        if !seen.insert(id.clone()) {
            warn!(item_id = %id, "duplicate watchlist entry ignored");
            continue;
        }
        items.push(TrackedItem {
            id,
            label: entry.label,
        });
    }
    if items.is_empty() {
        bail!("watchlist has no items");
    }
    Ok(items)
}

/// Classify `current` against the last known state of the item.
///
/// First match wins: no history, same payable price, newly listed, became
/// free, lost price data, otherwise a price change.
pub fn classify(
    item: &TrackedItem,
    item_name: &str,
    previous: Option<&PriceState>,
    current: &PriceState,
) -> ChangeEvent {
    ChangeEvent {
        item: item.clone(),
        item_name: item_name.to_string(),
        previous: previous.cloned(),
        current: current.clone(),
        kind: change_kind(previous, current),
    }
}

pub fn change_kind(previous: Option<&PriceState>, current: &PriceState) -> ChangeKind {
    let Some(previous) = previous else {
        return ChangeKind::FirstSighting;
    };
    if previous.same_payable_price(current) {
        return ChangeKind::Unchanged;
    }
    match (previous, current) {
        (PriceState::NoPriceData, _) => ChangeKind::NewListing,
        (_, PriceState::FreeToPlay) => ChangeKind::BecameFree,
        (_, PriceState::NoPriceData) => ChangeKind::LostPriceData,
        _ => ChangeKind::PriceChanged,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    pub item_id: String,
    pub item_name: String,
    pub kind: ChangeKind,
    pub headline: String,
    pub previous: String,
    pub current: String,
    pub discount_percent: Option<u8>,
    pub original_price: Option<String>,
}

impl NotificationMessage {
    fn from_event(event: &ChangeEvent) -> Self {
        let (discount_percent, original_price) = match &event.current {
            PriceState::Priced {
                initial_minor,
                currency,
                discount_percent,
                ..
            } if event.kind == ChangeKind::PriceChanged && *discount_percent > 0 => (
                Some(*discount_percent),
                Some(PriceState::regular(*initial_minor, currency.clone()).to_string()),
            ),
            _ => (None, None),
        };
        Self {
            item_id: event.item.id.clone(),
            item_name: event.item_name.clone(),
            kind: event.kind,
            headline: headline_for(event),
            previous: event
                .previous
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string()),
            current: event.current.to_string(),
            discount_percent,
            original_price,
        }
    }

    pub fn render(&self) -> String {
        let mut block = format!(
            "### {}\n- Previous: {}\n- Current: {}",
            self.headline, self.previous, self.current
        );
        if let Some(percent) = self.discount_percent {
            block.push_str(&format!("\n- Discount: {percent}% OFF"));
            if let Some(original) = &self.original_price {
                block.push_str(&format!(" (Orig: {original})"));
            }
        }
        block
    }
}

fn headline_for(event: &ChangeEvent) -> String {
    let name = &event.item_name;
    match event.kind {
        ChangeKind::NewListing => format!("{name} is now listed"),
        ChangeKind::BecameFree => format!("{name} is now free to play"),
        ChangeKind::LostPriceData => format!("{name} no longer has price data"),
        ChangeKind::PriceChanged => match event.movement() {
            Some(PriceMovement::Drop) if event.current.is_on_sale() => format!("{name} is on sale"),
            Some(PriceMovement::Drop) => format!("{name} dropped in price"),
            Some(PriceMovement::Rise) => format!("{name} went up in price"),
            Some(PriceMovement::WentRegular) => format!("{name} is back to its regular price"),
            None => format!("{name} is no longer free"),
        },
        ChangeKind::FirstSighting | ChangeKind::Unchanged => name.clone(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationBatch {
    pub messages: Vec<NotificationMessage>,
}

impl NotificationBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn render_markdown(&self, footer_link: Option<&str>) -> String {
        let mut doc = String::from("## Price change alert\n\n");
        doc.push_str(
            &self
                .messages
                .iter()
                .map(NotificationMessage::render)
                .collect::<Vec<_>>()
                .join("\n\n"),
        );
        doc.push('\n');
        if let Some(link) = footer_link {
            doc.push_str(&format!("\n[View store]({link})\n"));
        }
        doc
    }
}

/// Keep notifiable events, one message per item, in event order.
pub fn compose(events: &[ChangeEvent]) -> NotificationBatch {
    let mut seen = HashSet::new();
    let mut messages = Vec::new();
    for event in events.iter().filter(|event| event.kind.is_notifiable()) {
        if seen.insert(event.item.id.as_str()) {
            messages.push(NotificationMessage::from_event(event));
        }
    }
    NotificationBatch { messages }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    Written,
    Cleared,
    NothingToDo,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tracked_items: usize,
    pub fetched: usize,
    pub failed: usize,
    pub recorded: usize,
    pub history_updated: bool,
    pub change_counts: BTreeMap<ChangeKind, usize>,
    pub notifications: usize,
    pub notification: NotificationOutcome,
}

impl WatchRunSummary {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.change_counts.get(&kind).copied().unwrap_or(0)
    }
}

pub struct PriceWatch {
    config: WatchConfig,
    source: Box<dyn PriceSource>,
    history: HistoryStore,
    artifact: NotificationArtifact,
}

impl PriceWatch {
    pub fn new(config: WatchConfig, source: Box<dyn PriceSource>) -> Self {
        let history = HistoryStore::new(config.history_path.clone(), config.max_records);
        let artifact = NotificationArtifact::new(config.notification_path.clone());
        Self {
            config,
            source,
            history,
            artifact,
        }
    }

    /// Fixture directory when configured, the live storefront otherwise.
    pub fn from_config(config: WatchConfig) -> Result<Self> {
        let source: Box<dyn PriceSource> = match &config.fixtures_dir {
            Some(dir) => Box::new(FixturePriceSource::new(dir.clone())),
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                })?;
                Box::new(SteamStoreSource::new(http, config.market.clone()))
            }
        };
        Ok(Self::new(config, source))
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// One full cycle. Only a held run lock stops the run; every other failure
    /// is logged and the cycle carries on.
    pub async fn run_once(&self) -> Result<WatchRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("price_watch_run", %run_id, source = self.source.source_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<WatchRunSummary> {
        let started_at = Utc::now();
        let _lock = match &self.config.lock_path {
            Some(path) => Some(
                RunLock::acquire_with_stale_after(
                    path.clone(),
                    Duration::from_secs(self.config.lock_stale_after_secs),
                )
                .await
                .context("acquiring run lock")?,
            ),
            None => None,
        };

        info!(items = self.config.items.len(), "starting price check");
        let ctx = FetchContext {
            observed_at: observation_timestamp(),
        };
        let history_lines = match self.history.load_all().await {
            Ok(lines) => lines,
            Err(err) => {
                warn!("history unreadable, every item counts as first sighting: {err:#}");
                Vec::new()
            }
        };

        let mut events = Vec::new();
        let mut new_lines = Vec::new();
        let mut failed = 0usize;
        let mut change_counts: BTreeMap<ChangeKind, usize> = BTreeMap::new();

        for item in &self.config.items {
            let observation = match self.source.fetch(item, &ctx).await {
                Ok(observation) => observation,
                Err(err) => {
                    warn!(item_id = %item.id, timeout = err.is_timeout(), error = %err, "fetch failed; skipping item");
                    failed += 1;
                    continue;
                }
            };

            let previous = most_recent_for_item(&history_lines, &item.id, &observation.name);
            let event = classify(
                item,
                &observation.name,
                previous.as_ref().map(|record| &record.price_state),
                &observation.price_state,
            );
            info!(
                item_id = %item.id,
                name = %observation.name,
                current = %observation.price_state,
                kind = event.kind.as_str(),
                "item checked"
            );

            new_lines.push(encode_record(&PriceRecord::from(&observation)));
            *change_counts.entry(event.kind).or_default() += 1;
            events.push(event);
        }

        let history_updated = if new_lines.is_empty() {
            false
        } else {
            match self.history.append_and_cap(&new_lines).await {
                Ok(retained) => {
                    info!(appended = new_lines.len(), retained, "history updated");
                    true
                }
                Err(err) => {
                    warn!("history update failed, next run may see stale prices: {err:#}");
                    false
                }
            }
        };

        let batch = compose(&events);
        let notification = self.emit(&batch).await;

        Ok(WatchRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            tracked_items: self.config.items.len(),
            fetched: events.len(),
            failed,
            recorded: new_lines.len(),
            history_updated,
            change_counts,
            notifications: batch.len(),
            notification,
        })
    }

    async fn emit(&self, batch: &NotificationBatch) -> NotificationOutcome {
        if batch.is_empty() {
            return match self.artifact.clear().await {
                Ok(true) => {
                    info!(path = %self.artifact.path().display(), "removed stale notification");
                    NotificationOutcome::Cleared
                }
                Ok(false) => NotificationOutcome::NothingToDo,
                Err(err) => {
                    warn!("could not remove stale notification: {err:#}");
                    NotificationOutcome::Failed
                }
            };
        }

        let content = batch.render_markdown(self.config.store_link.as_deref());
        match self.artifact.write(&content).await {
            Ok(()) => {
                info!(
                    path = %self.artifact.path().display(),
                    messages = batch.len(),
                    "notification written"
                );
                NotificationOutcome::Written
            }
            Err(err) => {
                warn!("could not write notification: {err:#}");
                NotificationOutcome::Failed
            }
        }
    }
}

/// Local wall-clock time at whole-second precision, as written to the history log.
pub fn observation_timestamp() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

pub async fn run_once_from_env() -> Result<WatchRunSummary> {
    let config = WatchConfig::from_env()?;
    PriceWatch::from_config(config)?.run_once().await
}
