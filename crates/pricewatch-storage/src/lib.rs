//! History log codec + bounded file storage + HTTP fetch utilities for pricewatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime};
use pricewatch_core::{
    format_minor_units, PriceRecord, PriceState, FREE_TO_PLAY_LABEL, NO_PRICE_DATA_LABEL,
};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-storage";

pub const DEFAULT_MAX_RECORDS: usize = 100;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SALE_MARKER: &str = " (SALE -";
const REGULAR_MARKER: &str = " (Regular)";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("empty line")]
    Empty,
    #[error("line does not start with a bracketed timestamp")]
    MissingTimestamp,
    #[error("unreadable timestamp {0:?}")]
    BadTimestamp(String),
    #[error("no `name: price` separator")]
    MissingSeparator,
    #[error("empty item name")]
    MissingName,
    #[error("unreadable price {0:?}")]
    BadPrice(String),
    #[error("unreadable sale annotation {0:?}")]
    BadAnnotation(String),
}

/// Encode one record in the canonical history line shape (no trailing newline).
pub fn encode_record(record: &PriceRecord) -> String {
    let mut line = format!("[{}] ", record.timestamp.format(TIMESTAMP_FORMAT));
    if let Some(id) = &record.item_id {
        line.push('{');
        line.push_str(id);
        line.push_str("} ");
    }
    line.push_str(&single_line(&record.item_name));
    line.push_str(": ");
    match &record.price_state {
        PriceState::Priced {
            final_minor,
            initial_minor,
            currency,
            discount_percent,
        } => {
            line.push_str(&format_minor_units(*final_minor));
            if !currency.is_empty() {
                line.push(' ');
                line.push_str(currency);
            }
            if *discount_percent > 0 {
                line.push_str(&format!(
                    "{SALE_MARKER}{discount_percent}% | Orig: {})",
                    format_minor_units(*initial_minor)
                ));
            } else {
                line.push_str(REGULAR_MARKER);
            }
        }
        PriceState::FreeToPlay => line.push_str(FREE_TO_PLAY_LABEL),
        PriceState::NoPriceData => line.push_str(NO_PRICE_DATA_LABEL),
    }
    line
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

/// Decode one history line. Never panics; unknown shapes fail closed.
pub fn decode_record(line: &str) -> Result<PriceRecord, ParseFailure> {
    let line = line.trim_end_matches(['\n', '\r']).trim();
    if line.is_empty() {
        return Err(ParseFailure::Empty);
    }
    let rest = line.strip_prefix('[').ok_or(ParseFailure::MissingTimestamp)?;
    let (stamp, rest) = rest.split_once(']').ok_or(ParseFailure::MissingTimestamp)?;
    let timestamp = parse_timestamp(stamp.trim())?;
    let (item_id, rest) = split_item_id(rest.trim_start());

    let (item_name, price_state) = if let Some(name) = strip_label_tail(rest, FREE_TO_PLAY_LABEL) {
        (name, PriceState::FreeToPlay)
    } else if let Some(name) = strip_label_tail(rest, NO_PRICE_DATA_LABEL) {
        (name, PriceState::NoPriceData)
    } else {
        parse_priced_tail(rest)?
    };

    let item_name = item_name.trim();
    if item_name.is_empty() {
        return Err(ParseFailure::MissingName);
    }

    Ok(PriceRecord {
        timestamp,
        item_id,
        item_name: item_name.to_string(),
        price_state,
    })
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, ParseFailure> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(ts);
        }
    }
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.naive_local())
        .map_err(|_| ParseFailure::BadTimestamp(text.to_string()))
}

/// Splits a leading `{id}` token. Anything else is left as part of the name.
///
/// An id-less record whose name itself starts with `{word} ` reads back with
/// that word as its id; records built from observations always carry an id.
fn split_item_id(rest: &str) -> (Option<String>, &str) {
    let Some(inner) = rest.strip_prefix('{') else {
        return (None, rest);
    };
    let Some((id, after)) = inner.split_once('}') else {
        return (None, rest);
    };
    if id.is_empty() || id.chars().any(char::is_whitespace) || !after.starts_with(' ') {
        return (None, rest);
    }
    (Some(id.to_string()), after.trim_start())
}

fn strip_label_tail<'a>(rest: &'a str, label: &str) -> Option<&'a str> {
    let suffix_len = label.len() + 2;
    if rest.len() < suffix_len || !rest.is_char_boundary(rest.len() - suffix_len) {
        return None;
    }
    let (head, tail) = rest.split_at(rest.len() - suffix_len);
    let tail_label = tail.strip_prefix(": ")?;
    tail_label.eq_ignore_ascii_case(label).then_some(head)
}

fn parse_priced_tail(rest: &str) -> Result<(&str, PriceState), ParseFailure> {
    let (head, sale) = if let Some(head) = rest.strip_suffix(REGULAR_MARKER) {
        (head, None)
    } else if let Some(idx) = rest.ends_with(')').then(|| rest.rfind(SALE_MARKER)).flatten() {
        let annotation = &rest[idx + SALE_MARKER.len()..rest.len() - 1];
        (&rest[..idx], Some(parse_sale_annotation(annotation)?))
    } else {
        (rest, None)
    };

    let (name, price_text) = head.rsplit_once(": ").ok_or(ParseFailure::MissingSeparator)?;
    let (final_minor, currency) = parse_price_text(price_text.trim())
        .ok_or_else(|| ParseFailure::BadPrice(price_text.trim().to_string()))?;

    let state = match sale {
        Some((discount_percent, initial_minor)) => PriceState::Priced {
            final_minor,
            initial_minor: initial_minor.unwrap_or(final_minor),
            currency,
            discount_percent,
        },
        None => PriceState::regular(final_minor, currency),
    };
    Ok((name, state))
}

/// `25% | Orig: 199.0` or a bare `25%`.
fn parse_sale_annotation(text: &str) -> Result<(u8, Option<i64>), ParseFailure> {
    let bad = || ParseFailure::BadAnnotation(text.to_string());
    let (percent, remainder) = text.split_once('%').ok_or_else(bad)?;
    let percent: u8 = percent.trim().parse().map_err(|_| bad())?;
    let remainder = remainder.trim();
    if remainder.is_empty() {
        return Ok((percent, None));
    }
    let original = remainder
        .strip_prefix('|')
        .map(str::trim)
        .and_then(|r| r.strip_prefix("Orig:"))
        .ok_or_else(bad)?;
    let (initial_minor, _) = parse_price_text(original.trim()).ok_or_else(bad)?;
    Ok((percent, Some(initial_minor)))
}

fn currency_for_symbol(symbol: char) -> Option<&'static str> {
    match symbol {
        '¥' | '￥' => Some("CNY"),
        '$' => Some("USD"),
        '€' => Some("EUR"),
        '£' => Some("GBP"),
        _ => None,
    }
}

fn is_currency_code(token: &str) -> bool {
    !token.is_empty() && token.len() <= 4 && token.chars().all(|c| c.is_ascii_alphabetic())
}

/// Accepts `149.0 CNY`, `CNY 149.0`, `149.0`, `¥149.00` and `¥ 149.00`.
fn parse_price_text(text: &str) -> Option<(i64, String)> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    match tokens.as_slice() {
        [single] => {
            if let Some(amount) = parse_amount(single) {
                return Some((amount, String::new()));
            }
            let mut chars = single.chars();
            let code = currency_for_symbol(chars.next()?)?;
            Some((parse_amount(chars.as_str())?, code.to_string()))
        }
        [first, second] => {
            if let Some(amount) = parse_amount(first) {
                return is_currency_code(second).then(|| (amount, second.to_ascii_uppercase()));
            }
            let amount = parse_amount(second)?;
            if is_currency_code(first) {
                return Some((amount, first.to_ascii_uppercase()));
            }
            let mut chars = first.chars();
            let code = currency_for_symbol(chars.next()?)?;
            chars.as_str().is_empty().then(|| (amount, code.to_string()))
        }
        _ => None,
    }
}

/// Decimal text to minor units without going through floating point.
pub fn parse_amount(text: &str) -> Option<i64> {
    let cleaned: String = text.chars().filter(|c| *c != ',').collect();
    let (units, fraction) = match cleaned.split_once('.') {
        Some((units, fraction)) => (units, fraction),
        None => (cleaned.as_str(), ""),
    };
    if units.is_empty() || !units.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let units: i64 = units.parse().ok()?;
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction.parse().ok()?,
    };
    units.checked_mul(100)?.checked_add(cents)
}

/// Newest-to-oldest scan for the first line whose text contains `item_name`.
///
/// Containment rather than field equality lets id-less legacy lines match, at
/// the cost of misattribution when one item's name is a substring of another.
pub fn most_recent_by_name(lines: &[String], item_name: &str) -> Option<PriceRecord> {
    let line = lines.iter().rev().find(|line| line.contains(item_name))?;
    match decode_record(line) {
        Ok(record) => Some(record),
        Err(err) => {
            debug!(item_name, %err, "most recent history line is unreadable");
            None
        }
    }
}

/// Newest-to-oldest scan keyed by item id.
///
/// Lines that carry an `{id}` token match only on id equality. Lines without
/// one fall back to name containment.
pub fn most_recent_for_item(lines: &[String], item_id: &str, item_name: &str) -> Option<PriceRecord> {
    for line in lines.iter().rev() {
        match decode_record(line) {
            Ok(record) => {
                let matches = match record.item_id.as_deref() {
                    Some(id) => id == item_id,
                    None => line.contains(item_name),
                };
                if matches {
                    return Some(record);
                }
            }
            Err(err) if line.contains(item_name) => {
                debug!(item_id, item_name, %err, "most recent history line is unreadable");
                return None;
            }
            Err(_) => continue,
        }
    }
    None
}

/// Keep only the newest `max_records` lines.
pub fn cap_lines(mut lines: Vec<String>, max_records: usize) -> Vec<String> {
    if lines.len() > max_records {
        lines.drain(..lines.len() - max_records);
    }
    lines
}

/// Bounded, line-oriented price history file. Oldest line first.
///
/// Every update is a whole-file read-modify-write. Overlapping runs can lose
/// records; serialize them with [`RunLock`].
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    max_records: usize,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, max_records: usize) -> Self {
        Self {
            path: path.into(),
            max_records,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored lines; a store that does not exist yet is empty.
    ///
    /// Lines are decoded one by one, so bytes that are not UTF-8 only spoil
    /// the line they sit on.
    pub async fn load_all(&self) -> anyhow::Result<Vec<String>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes
                .split(|b| *b == b'\n')
                .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
                .filter(|line| !line.trim().is_empty())
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => {
                Err(err).with_context(|| format!("reading history {}", self.path.display()))
            }
        }
    }

    pub async fn find_most_recent(&self, item_name: &str) -> anyhow::Result<Option<PriceRecord>> {
        let lines = self.load_all().await?;
        Ok(most_recent_by_name(&lines, item_name))
    }

    pub async fn find_most_recent_for(
        &self,
        item_id: &str,
        item_name: &str,
    ) -> anyhow::Result<Option<PriceRecord>> {
        let lines = self.load_all().await?;
        Ok(most_recent_for_item(&lines, item_id, item_name))
    }

    /// Append `new_lines` in order and drop the oldest lines beyond the cap.
    ///
    /// Returns the number of lines retained.
    pub async fn append_and_cap(&self, new_lines: &[String]) -> anyhow::Result<usize> {
        let mut lines = self.load_all().await?;
        lines.extend(new_lines.iter().map(|line| single_line(line)));
        let lines = cap_lines(lines, self.max_records);

        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        write_atomically(&self.path, text.as_bytes()).await?;
        debug!(
            path = %self.path.display(),
            appended = new_lines.len(),
            retained = lines.len(),
            "history updated"
        );
        Ok(lines.len())
    }
}

/// The run's notification file. Present only while there is something to say.
#[derive(Debug, Clone)]
pub struct NotificationArtifact {
    path: PathBuf,
}

impl NotificationArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, content: &str) -> anyhow::Result<()> {
        write_atomically(&self.path, content.as_bytes()).await
    }

    /// Remove a stale artifact. Returns whether a file was removed.
    pub async fn clear(&self) -> anyhow::Result<bool> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err)
                .with_context(|| format!("removing notification {}", self.path.display())),
        }
    }
}

/// Replace `path` through a temp file + rename in the same directory.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// A lock older than this is assumed to belong to a run that died without
/// cleaning up. A healthy run takes seconds.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock at {0}")]
    Held(PathBuf),
    #[error("creating lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive marker file held for the duration of a run; removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub async fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        Self::acquire_with_stale_after(path, DEFAULT_LOCK_STALE_AFTER).await
    }

    /// Take the lock, replacing a leftover lock file older than `stale_after`.
    pub async fn acquire_with_stale_after(
        path: impl Into<PathBuf>,
        stale_after: Duration,
    ) -> Result<Self, LockError> {
        let path = path.into();
        match Self::try_create(&path).await {
            Err(LockError::Held(held)) => {
                let stale = lock_age(&held).await.is_some_and(|age| age >= stale_after);
                if !stale {
                    return Err(LockError::Held(held));
                }
                let owner = fs::read_to_string(&path).await.unwrap_or_default();
                warn!(
                    path = %path.display(),
                    owner = owner.trim(),
                    "taking over stale run lock"
                );
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(LockError::Io { path, source }),
                }
                // Another run may have won the takeover; that one keeps the lock.
                Self::try_create(&path).await
            }
            other => other,
        }
    }

    async fn try_create(path: &Path) -> Result<Self, LockError> {
        let opened = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held(path.to_path_buf()));
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let owner = format!("pid={}\n", std::process::id());
        if let Err(source) = file.write_all(owner.as_bytes()).await {
            let _ = fs::remove_file(path).await;
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// Time since the lock file was last written; `None` if that cannot be told.
async fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    modified.elapsed().ok()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Request(err) if err.is_timeout())
    }
}

/// Single-attempt GET client. Each scheduled run is its own retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .expect("date")
            .and_hms_opt(h, m, s)
            .expect("time")
    }

    fn record(id: Option<&str>, name: &str, state: PriceState) -> PriceRecord {
        PriceRecord {
            timestamp: ts(9, 30, 0),
            item_id: id.map(str::to_string),
            item_name: name.to_string(),
            price_state: state,
        }
    }

    #[test]
    fn canonical_sale_line_shape() {
        let line = encode_record(&record(
            Some("3472040"),
            "Half-Life: Alyx",
            PriceState::on_sale(14900, 19900, "CNY", 25),
        ));
        assert_eq!(
            line,
            "[2026-03-14 09:30:00] {3472040} Half-Life: Alyx: 149.0 CNY (SALE -25% | Orig: 199.0)"
        );
    }

    #[test]
    fn canonical_shapes_round_trip() {
        let records = [
            record(Some("1"), "Game", PriceState::on_sale(14900, 19900, "CNY", 25)),
            record(Some("1"), "Game: Deluxe", PriceState::regular(1999, "USD")),
            record(Some("2"), "Free Game", PriceState::FreeToPlay),
            record(Some("3"), "Upcoming", PriceState::NoPriceData),
            record(None, "Legacy", PriceState::regular(9900, "CNY")),
        ];
        for original in records {
            let line = encode_record(&original);
            assert_eq!(decode_record(&line), Ok(original), "line: {line}");
        }
    }

    #[test]
    fn legacy_price_shapes_are_normalized() {
        let cases = [
            ("[2026-03-14 09:30:00] Game: 199.0 CNY", PriceState::regular(19900, "CNY")),
            ("[2026-03-14 09:30:00] Game: CNY 199.00", PriceState::regular(19900, "CNY")),
            ("[2026-03-14 09:30:00] Game: ¥199.00", PriceState::regular(19900, "CNY")),
            ("[2026-03-14 09:30:00] Game: $ 19.99", PriceState::regular(1999, "USD")),
            ("[2026-03-14 09:30:00] Game: 1,299.5", PriceState::regular(129950, "")),
            (
                "[2026-03-14T09:30:00] Game: 149.0 CNY (SALE -25%)",
                PriceState::on_sale(14900, 14900, "CNY", 25),
            ),
            ("[2026-03-14 09:30:00.123] Game: free to play", PriceState::FreeToPlay),
            ("[2026-03-14 09:30:00] Game: NO PRICE DATA", PriceState::NoPriceData),
        ];
        for (line, expected) in cases {
            let decoded = decode_record(line).unwrap_or_else(|e| panic!("{line}: {e}"));
            assert_eq!(decoded.item_name, "Game");
            assert_eq!(decoded.item_id, None);
            assert_eq!(decoded.price_state, expected, "line: {line}");
        }
    }

    #[test]
    fn malformed_lines_fail_closed() {
        assert_eq!(decode_record(""), Err(ParseFailure::Empty));
        assert_eq!(decode_record("Game: 1.0 CNY"), Err(ParseFailure::MissingTimestamp));
        assert!(matches!(
            decode_record("[yesterday] Game: 1.0 CNY"),
            Err(ParseFailure::BadTimestamp(_))
        ));
        assert!(matches!(
            decode_record("[2026-03-14 09:30:00] Game: about ten bucks"),
            Err(ParseFailure::BadPrice(_))
        ));
        assert_eq!(
            decode_record("[2026-03-14 09:30:00] just some text"),
            Err(ParseFailure::MissingSeparator)
        );
        assert_eq!(
            decode_record("[2026-03-14 09:30:00] : Free to Play"),
            Err(ParseFailure::MissingName)
        );
        assert!(matches!(
            decode_record("[2026-03-14 09:30:00] Game: 1.0 CNY (SALE -lots% | Orig: 2.0)"),
            Err(ParseFailure::BadAnnotation(_))
        ));
    }

    #[test]
    fn braced_word_at_start_of_legacy_name_reads_as_id() {
        let decoded = decode_record("[2026-03-14 09:30:00] {Deluxe} Game: Free to Play").expect("decode");
        assert_eq!(decoded.item_id.as_deref(), Some("Deluxe"));
        assert_eq!(decoded.item_name, "Game");
    }

    #[test]
    fn amounts_parse_without_rounding() {
        assert_eq!(parse_amount("19.99"), Some(1999));
        assert_eq!(parse_amount("19.9"), Some(1990));
        assert_eq!(parse_amount("19"), Some(1900));
        assert_eq!(parse_amount("0.07"), Some(7));
        assert_eq!(parse_amount("19.999"), None);
        assert_eq!(parse_amount("-1.0"), None);
        assert_eq!(parse_amount(".5"), None);
    }

    #[test]
    fn name_lookup_scans_newest_first() {
        let lines = vec![
            "[2026-03-13 09:00:00] Game: 199.0 CNY (Regular)".to_string(),
            "[2026-03-13 09:00:00] Other: Free to Play".to_string(),
            "[2026-03-14 09:00:00] Game: 149.0 CNY (SALE -25% | Orig: 199.0)".to_string(),
        ];
        let found = most_recent_by_name(&lines, "Game").expect("record");
        assert_eq!(found.price_state, PriceState::on_sale(14900, 19900, "CNY", 25));
        assert!(most_recent_by_name(&lines, "Missing").is_none());
    }

    #[test]
    fn unreadable_newest_match_counts_as_no_record() {
        let lines = vec![
            "[2026-03-13 09:00:00] Game: 199.0 CNY (Regular)".to_string(),
            "garbage line mentioning Game".to_string(),
        ];
        assert!(most_recent_by_name(&lines, "Game").is_none());
        assert!(most_recent_for_item(&lines, "1", "Game").is_none());
    }

    #[test]
    fn id_lookup_ignores_other_items_with_overlapping_names() {
        let lines = vec![
            "[2026-03-13 09:00:00] {10} Portal: 37.0 CNY (Regular)".to_string(),
            "[2026-03-14 09:00:00] {20} Portal 2: 42.0 CNY (Regular)".to_string(),
        ];
        let found = most_recent_for_item(&lines, "10", "Portal").expect("record");
        assert_eq!(found.item_id.as_deref(), Some("10"));
        assert_eq!(found.price_state, PriceState::regular(3700, "CNY"));

        // Plain containment would have picked the newer "Portal 2" line.
        let by_name = most_recent_by_name(&lines, "Portal").expect("record");
        assert_eq!(by_name.item_id.as_deref(), Some("20"));
    }

    #[test]
    fn id_lookup_falls_back_to_legacy_lines() {
        let lines = vec![
            "[2026-03-13 09:00:00] Portal: 37.0 CNY (Regular)".to_string(),
            "[2026-03-14 09:00:00] {20} Portal 2: 42.0 CNY (Regular)".to_string(),
        ];
        let found = most_recent_for_item(&lines, "10", "Portal").expect("record");
        assert_eq!(found.item_id, None);
        assert_eq!(found.price_state, PriceState::regular(3700, "CNY"));
    }

    #[test]
    fn cap_keeps_the_newest_lines() {
        let lines: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        assert_eq!(cap_lines(lines.clone(), 3), vec!["4", "5", "6"]);
        assert_eq!(cap_lines(lines.clone(), 10), lines);
    }

    #[tokio::test]
    async fn missing_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("price_log.txt"), 5);
        assert!(store.load_all().await.expect("load").is_empty());
        assert!(store.find_most_recent("Game").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn append_and_cap_never_exceeds_bound() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("nested/price_log.txt"), 5);

        let mut appended = Vec::new();
        for batch in 0..4 {
            let lines: Vec<String> = (0..3).map(|i| format!("line-{batch}-{i}")).collect();
            appended.extend(lines.clone());
            let retained = store.append_and_cap(&lines).await.expect("append");
            assert!(retained <= 5);
        }

        let stored = store.load_all().await.expect("load");
        assert_eq!(stored, appended[appended.len() - 5..].to_vec());
        let text = std::fs::read_to_string(store.path()).expect("read");
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn store_lookup_reads_appended_records() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("price_log.txt"), DEFAULT_MAX_RECORDS);
        let line = encode_record(&record(Some("7"), "Game", PriceState::FreeToPlay));
        store.append_and_cap(&[line]).await.expect("append");

        let found = store.find_most_recent_for("7", "Game").await.expect("find");
        assert_eq!(found.map(|r| r.price_state), Some(PriceState::FreeToPlay));
    }

    #[tokio::test]
    async fn artifact_write_then_clear() {
        let dir = tempdir().expect("tempdir");
        let artifact = NotificationArtifact::new(dir.path().join("result.md"));

        assert!(!artifact.clear().await.expect("clear missing"));
        artifact.write("## hello\n").await.expect("write");
        assert_eq!(std::fs::read_to_string(artifact.path()).expect("read"), "## hello\n");
        assert!(artifact.clear().await.expect("clear"));
        assert!(!artifact.path().exists());
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_until_dropped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pricewatch.lock");

        let first = RunLock::acquire(&path).await.expect("first lock");
        assert!(matches!(RunLock::acquire(&path).await, Err(LockError::Held(_))));
        drop(first);
        assert!(!path.exists());
        RunLock::acquire(&path).await.expect("lock after release");
    }

    #[tokio::test]
    async fn lock_left_by_a_dead_run_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pricewatch.lock");
        std::fs::write(&path, "pid=4242\n").expect("plant lock");
        let two_hours_ago = std::time::SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .expect("open lock")
            .set_modified(two_hours_ago)
            .expect("age lock");

        let lock = RunLock::acquire(&path).await.expect("stale lock taken over");
        let owner = std::fs::read_to_string(&path).expect("read lock");
        assert_eq!(owner, format!("pid={}\n", std::process::id()));
        drop(lock);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn recent_lock_is_not_taken_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pricewatch.lock");
        std::fs::write(&path, "pid=4242\n").expect("plant lock");

        let held = RunLock::acquire_with_stale_after(&path, Duration::from_secs(60)).await;
        assert!(matches!(held, Err(LockError::Held(_))));
        assert_eq!(std::fs::read_to_string(&path).expect("read lock"), "pid=4242\n");
    }

    #[tokio::test]
    async fn non_utf8_line_only_spoils_itself() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("price_log.txt"), DEFAULT_MAX_RECORDS);
        let mut bytes = b"[2026-03-13 09:00:00] {1} One: 199.0 CNY (Regular)\n".to_vec();
        bytes.extend_from_slice(b"[2026-03-13 09:00:00] {2} Caf\xE9: 5.0 CNY (Regular)\r\n");
        std::fs::write(store.path(), &bytes).expect("seed");

        let lines = store.load_all().await.expect("load");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("(Regular)"));

        let found = store.find_most_recent_for("1", "One").await.expect("find");
        assert_eq!(found.map(|r| r.price_state), Some(PriceState::regular(19900, "CNY")));

        let line = encode_record(&record(Some("1"), "One", PriceState::regular(9900, "CNY")));
        assert_eq!(store.append_and_cap(&[line]).await.expect("append"), 3);
        let found = store.find_most_recent_for("1", "One").await.expect("find");
        assert_eq!(found.map(|r| r.price_state), Some(PriceState::regular(9900, "CNY")));
    }
}
