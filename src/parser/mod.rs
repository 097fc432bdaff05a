//! Order extraction from free-text group messages.
//!
//! A message either becomes a [`ParsedOrder`] or it is silently not an
//! order; malformed text is an expected outcome, never an error. Location
//! extraction runs a fixed strategy ladder (labeled pattern → preposition
//! pattern → position scan → dash pattern), with an optional AI fallback
//! when every pattern misses.

pub mod cities;
pub mod parser_tests;

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::ai::AiExtractor;
use crate::geo::{Coords, GeoResolver};
use crate::parser::cities::{
    CITY_ALIASES, CITY_DECLENSIONS, CLOSED_MARKERS, KNOWN_CITIES, NOT_CITIES, ORDER_KEYWORDS,
    REGIONS, STREET_WORDS,
};

const PRICE_MIN: i64 = 500;
const PRICE_MAX: i64 = 500_000;

/// One ride request extracted from one source message.
#[derive(Debug, Clone)]
pub struct ParsedOrder {
    pub point_a: String,
    pub point_b: String,
    pub price: Option<i64>,
    pub original_text: String,
    /// Canonical (bare, positive) id of the source chat.
    pub source_group_id: i64,
    pub source_group_title: Option<String>,
    /// Deep link to the original message; uniqueness key for order storage.
    pub source_link: String,
    pub region: Option<&'static str>,
    pub point_a_coords: Option<Coords>,
    pub point_b_coords: Option<Coords>,
    pub message_id: i64,
    pub author_id: Option<i64>,
    pub author_username: Option<String>,
    pub author_first_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Raw message as delivered by a monitor, before extraction.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub chat_title: Option<String>,
    pub chat_username: Option<String>,
    pub message_id: i64,
    pub text: String,
    pub author_id: Option<i64>,
    pub author_username: Option<String>,
    pub author_first_name: Option<String>,
}

// ───────────────────────────── Gate ──────────────────────────────────────

pub fn is_closed_order(text: &str) -> bool {
    let lower = text.to_lowercase();
    CLOSED_MARKERS.iter().any(|m| lower.contains(m))
}

static GATE_DASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[А-Яа-яЁё]+\s*[-–—→>]\s*[А-Яа-яЁё]+").unwrap());
static GATE_PREPOSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:из|от|с)\s+[А-Яа-яЁё]+\s+(?:в|до|на)\s+[А-Яа-яЁё]+").unwrap()
});
static GATE_LABELED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)[аa]\s*[:.\-–].*[бb]\s*[:.\-–]").unwrap());

/// Cheap pre-filter: worth running extraction at all?
pub fn is_order_message(text: &str) -> bool {
    if text.is_empty() || is_closed_order(text) {
        return false;
    }
    let lower = text.to_lowercase();
    if ORDER_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return true;
    }
    GATE_DASH_RE.is_match(text) || GATE_PREPOSITION_RE.is_match(&lower) || GATE_LABELED_RE.is_match(text)
}

// ─────────────────────── Dictionary helpers ──────────────────────────────

/// Known cities with lowercase form, longest first so that
/// "Набережные Челны" wins over any shorter overlap.
static CITIES_LOWER: LazyLock<Vec<(String, &'static str)>> = LazyLock::new(|| {
    let mut v: Vec<(String, &'static str)> = KNOWN_CITIES
        .iter()
        .map(|c| (c.to_lowercase(), *c))
        .collect();
    v.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
    v
});

/// Find `needle` in `haystack` at an alphabetic-run boundary; matches that
/// are substrings of a longer word are rejected.
fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = haystack[start..].find(needle) {
        let pos = start + rel;
        let end = pos + needle.len();
        let ok_before = haystack[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphabetic());
        let ok_after = haystack[end..].chars().next().is_none_or(|c| !c.is_alphabetic());
        if ok_before && ok_after {
            return Some(pos);
        }
        start = end.max(start + 1);
    }
    None
}

/// Resolve a raw fragment to a canonical city via alias or dictionary
/// substring search.
fn find_city_in(fragment: &str) -> Option<&'static str> {
    let lower = fragment.to_lowercase();
    for &(alias, canon) in CITY_ALIASES {
        if find_word(&lower, alias).is_some() {
            return Some(canon);
        }
    }
    for &(ref city_lower, canon) in CITIES_LOWER.iter() {
        if find_word(&lower, city_lower).is_some() {
            return Some(canon);
        }
    }
    None
}

fn alias_or_declension(lower: &str) -> Option<&'static str> {
    CITY_ALIASES
        .iter()
        .chain(CITY_DECLENSIONS.iter())
        .find(|&&(from, _)| from == lower)
        .map(|&(_, to)| to)
}

/// Map a declined/aliased form back to nominative; unknown forms pass
/// through unchanged.
fn normalize_city(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    match alias_or_declension(&lower) {
        Some(canon) => canon.to_string(),
        None => raw.trim().to_string(),
    }
}

// ───────────────────────── Fuzzy matching ────────────────────────────────

fn normalize_for_fuzzy(s: &str) -> String {
    s.trim().to_lowercase().replace('ё', "е").replace('й', "и")
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Normalized edit similarity in [0, 1].
fn similarity(a: &str, b: &str) -> f64 {
    let ac: Vec<char> = a.chars().collect();
    let bc: Vec<char> = b.chars().collect();
    let max_len = ac.len().max(bc.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&ac, &bc) as f64 / max_len as f64
}

/// Dictionary lookup tolerant of typos and ё/й spelling variants.
fn fuzzy_match_city(raw: &str, threshold: f64) -> Option<&'static str> {
    let norm = normalize_for_fuzzy(raw);
    if norm.is_empty() {
        return None;
    }
    for &(ref city_lower, canon) in CITIES_LOWER.iter() {
        if normalize_for_fuzzy(city_lower) == norm {
            return Some(canon);
        }
    }
    let mut best: Option<(&'static str, f64)> = None;
    for &(ref city_lower, canon) in CITIES_LOWER.iter() {
        let ratio = similarity(&norm, &normalize_for_fuzzy(city_lower));
        if ratio >= threshold && best.is_none_or(|(_, b)| ratio > b) {
            best = Some((canon, ratio));
        }
    }
    best.map(|(c, _)| c)
}

// ─────────────────── Strategy a: labeled A/B patterns ────────────────────

static AB_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*[🚩📍]?\s*(?:точка\s*)?[аa]\s*[:.\-–]\s*(.+?)\s*$(?s:.*?)^\s*[🏁📍]?\s*(?:точка\s*)?[бb]\s*[:.\-–]\s*(.+?)\s*$",
    )
    .unwrap()
});
static AB_FROM_TO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)(?:откуда|отправление)\s*[:.\-–]?\s*([^\n]+?)\s*\n.*?(?:куда|назначение|прибытие)\s*[:.\-–]?\s*([^\n]+)",
    )
    .unwrap()
});
static AB_INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[^\p{L}])(?:точка\s*)?[аa]\s*[:.\-–]\s*(.+?)\s*/?\s+(?:точка\s*)?[бb]\s*[:.\-–]\s*([^\n]+)",
    )
    .unwrap()
});
static AB_FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"🚩\s*([^\n🏁]+?)\s*🏁\s*([^\n]+)").unwrap());

/// Resolve one labeled side: dictionary hit inside the fragment, then fuzzy
/// match of the first word, then the raw first word for later validation.
fn resolve_labeled_side(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches([',', '/', '.']).trim();
    if let Some(city) = find_city_in(trimmed) {
        return Some(city.to_string());
    }
    let first_word = trimmed.split_whitespace().next()?;
    if first_word.chars().count() < 3 {
        return None;
    }
    if let Some(city) = fuzzy_match_city(first_word, 0.8) {
        return Some(city.to_string());
    }
    Some(normalize_city(first_word))
}

fn extract_with_ab_pattern(text: &str) -> Option<(String, String)> {
    for re in [&*AB_BLOCK_RE, &*AB_FROM_TO_RE, &*AB_INLINE_RE, &*AB_FLAG_RE] {
        if let Some(caps) = re.captures(text) {
            let a = resolve_labeled_side(&caps[1]);
            let b = resolve_labeled_side(&caps[2]);
            if let (Some(a), Some(b)) = (a, b) {
                return Some((a, b));
            }
        }
    }
    None
}

// ─────────────────── Strategy b: preposition pattern ─────────────────────

static PREPOSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[^\p{L}])(?:из|от|с)\s+([А-Яа-яЁё][А-Яа-яЁё\-]*(?:\s+[А-Яа-яЁё\-]+)?)\s+(?:в|до|на|к)\s+([А-Яа-яЁё][А-Яа-яЁё\-]*(?:\s+[А-Яа-яЁё\-]+)?)",
    )
    .unwrap()
});

fn extract_with_preposition_pattern(text: &str) -> Option<(String, String)> {
    let caps = PREPOSITION_RE.captures(text)?;
    let a_norm = normalize_city(caps[1].trim_end_matches(','));
    let b_norm = normalize_city(caps[2].trim_end_matches(','));

    let a = find_city_in(&a_norm)
        .map(str::to_string)
        .or_else(|| fuzzy_match_city(&a_norm, 0.85).map(str::to_string));
    let b = find_city_in(&b_norm)
        .map(str::to_string)
        .or_else(|| fuzzy_match_city(&b_norm, 0.85).map(str::to_string));

    match (a, b) {
        (Some(a), Some(b)) => Some((a, b)),
        _ => None,
    }
}

// ─────────────────── Strategy c: position-based scan ─────────────────────

/// Find every known city or alias anywhere in the text and keep the two
/// left-most non-overlapping distinct hits as (origin, destination).
fn extract_by_position(text: &str) -> Option<(String, String)> {
    let lower = text.to_lowercase();
    let mut found: Vec<(usize, &'static str, usize)> = Vec::new();

    for &(alias, canon) in CITY_ALIASES {
        if let Some(pos) = find_word(&lower, alias) {
            if !found.iter().any(|&(_, c, _)| c == canon) {
                found.push((pos, canon, alias.len()));
            }
        }
    }
    for &(ref city_lower, canon) in CITIES_LOWER.iter() {
        if let Some(pos) = find_word(&lower, city_lower) {
            if !found.iter().any(|&(_, c, _)| c == canon) {
                found.push((pos, canon, city_lower.len()));
            }
        }
    }

    found.sort_by_key(|(pos, _, _)| *pos);

    let mut unique: Vec<(usize, &'static str, usize)> = Vec::new();
    for (pos, canon, len) in found {
        let overlaps = unique
            .iter()
            .any(|&(upos, _, ulen)| pos < upos + ulen && upos < pos + len);
        if !overlaps {
            unique.push((pos, canon, len));
        }
    }

    if unique.len() >= 2 {
        Some((unique[0].1.to_string(), unique[1].1.to_string()))
    } else {
        None
    }
}

// ─────────────────── Strategy d: dash/arrow pattern ──────────────────────

static DASH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([А-Яа-яЁё][А-Яа-яЁё\-]+(?:\s+[А-Яа-яЁё\-]+)?)\s*[-–—→>]+\s*([А-Яа-яЁё][А-Яа-яЁё\-]+(?:\s+[А-Яа-яЁё\-]+)?)",
    )
    .unwrap()
});

/// Heuristic rejection of street-address-like fragments.
fn looks_like_address(fragment: &str) -> bool {
    if fragment.starts_with(|c: char| c.is_ascii_digit()) {
        return true;
    }
    let lower = fragment.to_lowercase();
    STREET_WORDS.iter().any(|w| {
        lower.starts_with(&format!("{w} ")) || lower.starts_with(&format!("{w}."))
    })
}

fn extract_with_dash_pattern(text: &str) -> Option<(String, String)> {
    for caps in DASH_RE.captures_iter(text) {
        let a_raw = caps[1].trim();
        let b_raw = caps[2].trim();

        let a = find_city_in(a_raw)
            .map(str::to_string)
            .or_else(|| fuzzy_match_city(a_raw, 0.85).map(str::to_string));
        let b = find_city_in(b_raw)
            .map(str::to_string)
            .or_else(|| fuzzy_match_city(b_raw, 0.85).map(str::to_string));

        if let (Some(a), Some(b)) = (&a, &b) {
            return Some((a.clone(), b.clone()));
        }

        // Unknown names still pass through (small villages are legitimate)
        // unless they read like street addresses; validation decides later.
        if a_raw.chars().count() >= 3
            && b_raw.chars().count() >= 3
            && !looks_like_address(a_raw)
            && !looks_like_address(b_raw)
        {
            return Some((
                a.unwrap_or_else(|| normalize_city(a_raw)),
                b.unwrap_or_else(|| normalize_city(b_raw)),
            ));
        }
    }
    None
}

/// Strategy ladder; first success wins.
pub fn extract_locations(text: &str) -> Option<(String, String)> {
    extract_with_ab_pattern(text)
        .map(|(a, b)| (normalize_city(&a), normalize_city(&b)))
        .or_else(|| extract_with_preposition_pattern(text))
        .or_else(|| extract_by_position(text))
        .or_else(|| {
            extract_with_dash_pattern(text).map(|(a, b)| (normalize_city(&a), normalize_city(&b)))
        })
}

// ───────────────────────── Price extraction ──────────────────────────────

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,2}[./]\d{1,2}[./]\d{2,4}").unwrap());
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{1,2}\s*:\s*\d{2}").unwrap());
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+7|8|7)[\s\-]?\(?\d{3}\)?[\s\-]?\d{3}[\s\-]?\d{2}[\s\-]?\d{2}").unwrap()
});
static PRICE_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,3}),(\d{3})\s*(?:руб\w*|₽|р\.?\b)?").unwrap());
static PRICE_CURRENCY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{3,5})\s*(?:руб\w*|₽|р\.?\b)").unwrap());
static PRICE_THOUSANDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^\d])(\d{1,2})\s*(?:к\b|тыс\.?|т\b\.?)").unwrap()
});
static PRICE_STANDALONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(\d{4,5})(?:\s|$)").unwrap());

fn in_bounds(price: i64) -> Option<i64> {
    (PRICE_MIN..=PRICE_MAX).contains(&price).then_some(price)
}

/// Price in rubles, independent of city extraction. Dates, clock times and
/// phone numbers are stripped first so their digits never read as prices.
/// First matching rule wins; candidates outside [500, 500000] fall through.
pub fn extract_price(text: &str) -> Option<i64> {
    let clean = DATE_RE.replace_all(text, "");
    let clean = TIME_RE.replace_all(&clean, "");
    let clean = PHONE_RE.replace_all(&clean, "");

    if let Some(caps) = PRICE_COMMA_RE.captures(&clean) {
        let joined = format!("{}{}", &caps[1], &caps[2]);
        if let Some(p) = joined.parse().ok().and_then(in_bounds) {
            return Some(p);
        }
    }
    if let Some(caps) = PRICE_CURRENCY_RE.captures(&clean) {
        if let Some(p) = caps[1].parse().ok().and_then(in_bounds) {
            return Some(p);
        }
    }
    if let Some(caps) = PRICE_THOUSANDS_RE.captures(&clean) {
        if let Some(p) = caps[1].parse::<i64>().ok().map(|n| n * 1000).and_then(in_bounds) {
            return Some(p);
        }
    }
    if let Some(caps) = PRICE_STANDALONE_RE.captures(&clean) {
        if let Some(p) = caps[1].parse().ok().and_then(in_bounds) {
            return Some(p);
        }
    }
    None
}

// ──────────────────────── Region detection ───────────────────────────────

/// Best-effort macro-region classification; never gates order validity.
pub fn detect_region(text: &str, point_a: &str, point_b: &str) -> Option<&'static str> {
    let combined = format!("{text} {point_a} {point_b}").to_lowercase();
    for &(region, names) in REGIONS {
        if names.iter().any(|n| combined.contains(n)) {
            return Some(region);
        }
    }
    None
}

// ───────────────────────── Deep links ────────────────────────────────────

/// Deep link to the source message. Public chats link by username; private
/// supergroups use the `/c/<bare>/<msg>` form with the `-100` marker
/// stripped.
pub fn telegram_link(chat_id: i64, message_id: i64, username: Option<&str>) -> String {
    if let Some(u) = username {
        return format!("https://t.me/{u}/{message_id}");
    }
    let mut bare = chat_id.abs();
    if bare > 1_000_000_000_000 {
        bare -= 1_000_000_000_000;
    }
    format!("https://t.me/c/{bare}/{message_id}")
}

/// Normalize any encoding of a chat id (negative, `-100`-prefixed marked
/// form) to the canonical bare positive id. Applied at every ingestion
/// boundary so the store only ever compares one representation.
pub fn canonical_group_id(id: i64) -> i64 {
    let mut v = id.abs();
    if v > 1_000_000_000_000 {
        v -= 1_000_000_000_000;
    }
    v
}

// ───────────────────────── Order extractor ───────────────────────────────

pub struct OrderExtractor {
    geo: Arc<GeoResolver>,
    ai: Option<AiExtractor>,
}

impl OrderExtractor {
    pub fn new(geo: Arc<GeoResolver>, ai: Option<AiExtractor>) -> Self {
        Self { geo, ai }
    }

    /// A candidate city name is valid when it is long enough, not a number,
    /// not a stoplisted domain word, and either known to the dictionary or
    /// independently geocodable.
    pub async fn is_valid_city(&self, name: &str) -> bool {
        let lower = name.trim().to_lowercase();
        if lower.chars().count() < 3 {
            return false;
        }
        if lower.starts_with(|c: char| c.is_ascii_digit()) {
            return false;
        }
        if NOT_CITIES.contains(&lower.as_str()) {
            return false;
        }
        if CITIES_LOWER.iter().any(|(c, _)| *c == lower) || alias_or_declension(&lower).is_some() {
            return true;
        }
        let geocodable = self.geo.resolve(name).await.is_some();
        if !geocodable {
            debug!("Invalid city name rejected: {name}");
        }
        geocodable
    }

    /// Run the full pipeline for one message. `None` means "not an order",
    /// which is an expected outcome, not a failure.
    pub async fn extract(&self, msg: &IncomingMessage) -> Option<ParsedOrder> {
        let text = msg.text.trim();
        if !is_order_message(text) {
            return None;
        }

        let mut located = extract_locations(text);
        let mut price = extract_price(text);

        if located.is_none() {
            if let Some(ai) = &self.ai {
                if ai.is_enabled() {
                    info!("Using AI fallback for: {}...", truncate(text, 50));
                    if let Some((a, b, ai_price)) = ai.extract(text).await {
                        if self.is_valid_city(&a).await && self.is_valid_city(&b).await {
                            info!("AI extracted valid cities: {a} -> {b}");
                            located = Some((normalize_city(&a), normalize_city(&b)));
                            if price.is_none() {
                                price = ai_price.and_then(in_bounds);
                            }
                        } else {
                            info!("AI extracted invalid cities: {a} -> {b} - rejected");
                        }
                    }
                }
            }
        }

        let (point_a, point_b) = match located {
            Some(pair) => pair,
            None => {
                debug!("No valid cities found in: {}...", truncate(text, 100));
                return None;
            }
        };

        if !self.is_valid_city(&point_a).await || !self.is_valid_city(&point_b).await {
            info!("Order rejected - invalid city names: {point_a} -> {point_b}");
            return None;
        }

        let region = detect_region(text, &point_a, &point_b);
        let point_a_coords = self.geo.resolve(&point_a).await;
        let point_b_coords = self.geo.resolve(&point_b).await;
        if point_a_coords.is_none() {
            warn!("No coordinates for origin '{point_a}'; order will not match");
        }

        let canonical_chat = canonical_group_id(msg.chat_id);
        Some(ParsedOrder {
            point_a,
            point_b,
            price,
            original_text: text.to_string(),
            source_group_id: canonical_chat,
            source_group_title: msg.chat_title.clone(),
            source_link: telegram_link(canonical_chat, msg.message_id, msg.chat_username.as_deref()),
            region,
            point_a_coords,
            point_b_coords,
            message_id: msg.message_id,
            author_id: msg.author_id,
            author_username: msg.author_username.clone(),
            author_first_name: msg.author_first_name.clone(),
            received_at: Utc::now(),
        })
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
