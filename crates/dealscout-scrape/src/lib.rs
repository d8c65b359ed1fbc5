//! Catalog/detail page parsing and fuzzy text classification.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::Hash;

use dealscout_core::{ListingSummary, PLACEHOLDER_IMAGE, UNKNOWN_CATEGORY};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dealscout-scrape";

/// Similarity floor (0-100) a target model must clear to label a listing.
const CATEGORY_THRESHOLD: f64 = 90.0;
/// Similarity floor (0-100) a blacklist term must clear to flag spam.
const SPAM_THRESHOLD: f64 = 80.0;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no locator configured for `{0}`")]
    Missing(String),
    #[error("unknown locator key `{0}`")]
    Unknown(String),
    #[error("invalid locator `{locator}` for `{key}`: {message}")]
    Invalid {
        key: String,
        locator: String,
        message: String,
    },
}

/// Validated structural selectors. Configuration supplies an opaque
/// key -> CSS locator map; unknown keys and unparsable locators are
/// rejected here, once, instead of failing mid-parse.
#[derive(Debug, Clone)]
pub struct SelectorMap {
    card: Selector,
    price: Selector,
    params: Selector,
    description: Selector,
    image: Selector,
    offer_title: Selector,
    date: Selector,
    place: Selector,
    anchor: Selector,
    heading: Selector,
}

impl SelectorMap {
    pub const KEYS: &'static [&'static str] = &[
        "card",
        "price",
        "params",
        "description",
        "image",
        "offer_title",
        "date",
        "place",
    ];

    pub fn from_locators(locators: &BTreeMap<String, String>) -> Result<Self, SelectorError> {
        for key in locators.keys() {
            if !Self::KEYS.contains(&key.as_str()) {
                return Err(SelectorError::Unknown(key.clone()));
            }
        }
        let parse = |key: &str| -> Result<Selector, SelectorError> {
            let locator = locators
                .get(key)
                .ok_or_else(|| SelectorError::Missing(key.to_string()))?;
            Selector::parse(locator).map_err(|e| SelectorError::Invalid {
                key: key.to_string(),
                locator: locator.clone(),
                message: e.to_string(),
            })
        };
        let fixed = |locator: &str| -> Result<Selector, SelectorError> {
            Selector::parse(locator).map_err(|e| SelectorError::Invalid {
                key: locator.to_string(),
                locator: locator.to_string(),
                message: e.to_string(),
            })
        };
        Ok(Self {
            card: parse("card")?,
            price: parse("price")?,
            params: parse("params")?,
            description: parse("description")?,
            image: parse("image")?,
            offer_title: parse("offer_title")?,
            date: parse("date")?,
            place: parse("place")?,
            anchor: fixed("a")?,
            heading: fixed("h4")?,
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn joined_text(node: ElementRef<'_>) -> Option<String> {
    let raw = node.text().collect::<Vec<_>>().join(" ");
    text_or_none(raw.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn select_first_text(document: &Html, selector: &Selector) -> Option<String> {
    document.select(selector).next().and_then(joined_text)
}

/// Pull the stable listing id out of a link via the `-ID<alphanumeric>`
/// pattern the marketplace embeds in every listing URL.
pub fn extract_listing_id(url: &str) -> Option<String> {
    for (pos, _) in url.match_indices("-ID") {
        let id: String = url[pos + 3..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        if !id.is_empty() {
            return Some(id);
        }
    }
    None
}

/// `scheme://host` of a URL, for joining relative listing links.
pub fn site_origin(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.trim_end_matches('/').to_string();
    };
    let rest = &url[scheme_end + 3..];
    match rest.find('/') {
        Some(slash) => url[..scheme_end + 3 + slash].to_string(),
        None => url.to_string(),
    }
}

fn join_link(origin: &str, href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{origin}{href}")
    }
}

/// Extract listing summaries from one catalog page.
///
/// A card missing its link or id is skipped, not fatal. Zero cards is a
/// legitimate result the walker treats as a possible end of pagination.
pub fn parse_catalog_page(
    html: &str,
    selectors: &SelectorMap,
    origin: &str,
) -> Vec<ListingSummary> {
    let document = Html::parse_document(html);
    let mut items = Vec::new();

    for card in document.select(&selectors.card) {
        let Some(href) = card
            .select(&selectors.anchor)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let link = join_link(origin, href);
        let Some(id) = extract_listing_id(&link) else {
            warn!(%link, "no listing id in card link, skipping card");
            continue;
        };
        let title = card
            .select(&selectors.heading)
            .next()
            .and_then(joined_text)
            .unwrap_or_else(|| {
                warn!(%link, "card without title");
                "untitled".to_string()
            });
        let raw_price = card
            .select(&selectors.price)
            .next()
            .and_then(joined_text)
            .unwrap_or_else(|| {
                warn!(%link, "card without price");
                "0".to_string()
            });
        items.push(ListingSummary {
            id,
            title,
            link,
            raw_price,
        });
    }

    if items.is_empty() {
        debug!("no listing cards on page");
    }
    items
}

/// Structured attributes scraped from one listing's detail page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingDetails {
    pub id: String,
    pub link: String,
    pub title: String,
    pub category: String,
    pub place: String,
    pub date: String,
    pub image_link: String,
    pub description: String,
    pub ram: u32,
    pub cpu: String,
    pub disk_capacity: u32,
}

/// Second-pass parse of a listing detail page. `None` when the URL carries
/// no listing id; such listings are dropped from the enrichment result set
/// so they cannot contaminate the merge.
pub fn parse_detail_page(
    html: &str,
    url: &str,
    selectors: &SelectorMap,
    models: &BTreeSet<String>,
) -> Option<ListingDetails> {
    let id = extract_listing_id(url)?;
    let document = Html::parse_document(html);

    let (ram, disk_capacity, cpu) = match select_first_text(&document, &selectors.params) {
        Some(params) => (
            first_number_after(&params, "RAM:").unwrap_or(0) as u32,
            first_number_after(&params, "dysku:").unwrap_or(0) as u32,
            labeled_value_after(&params, "procesora:"),
        ),
        None => {
            debug!(url, "no parameter block on detail page");
            (0, 0, String::new())
        }
    };

    let description = select_first_text(&document, &selectors.description).unwrap_or_default();
    let place = select_first_text(&document, &selectors.place).unwrap_or_default();
    let date = select_first_text(&document, &selectors.date).unwrap_or_default();

    let image_link = document
        .select(&selectors.image)
        .next()
        .and_then(|n| n.value().attr("src"))
        .map(str::to_string)
        .filter(|src| src.contains("https://"))
        .unwrap_or_else(|| PLACEHOLDER_IMAGE.to_string());

    let title = select_first_text(&document, &selectors.offer_title)
        .unwrap_or_else(|| "untitled".to_string());
    let category = categorize(&clean_title(&title), models);

    Some(ListingDetails {
        id,
        link: url.to_string(),
        title,
        category,
        place,
        date,
        image_link,
        description,
        ram,
        cpu,
        disk_capacity,
    })
}

/// First run of digits after `marker` in `text`.
fn first_number_after(text: &str, marker: &str) -> Option<u64> {
    let rest = &text[text.find(marker)? + marker.len()..];
    let mut digits = String::new();
    for ch in rest.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

/// Free-text value following `marker`, up to the next `label:` token.
/// The value must end in a digit (model designations do); trailing words
/// without one are shed, and a value with no digit at all is empty.
fn labeled_value_after(text: &str, marker: &str) -> String {
    let Some(pos) = text.find(marker) else {
        return String::new();
    };
    let rest = &text[pos + marker.len()..];
    let mut tokens: Vec<&str> = Vec::new();
    for token in rest.split_whitespace() {
        if token.ends_with(':') {
            break;
        }
        tokens.push(token);
    }
    while let Some(last) = tokens.last() {
        if last.chars().any(|c| c.is_ascii_digit()) {
            break;
        }
        tokens.pop();
    }
    tokens.join(" ")
}

/// Lower-case the text and strip listing-title punctuation so fuzzy scores
/// compare words, not decoration.
pub fn clean_title(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|ch| match ch {
            '!' | '?' | '(' | ')' | '[' | ']' | '@' | ',' | '.' | ';' | '/' | '\\' | '"'
            | '\'' => ' ',
            c => c,
        })
        .collect();
    mapped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    strsim::normalized_levenshtein(a, b) * 100.0
}

/// Token-set similarity (0-100): word order and repetition are ignored, and
/// a title that fully contains the model name scores 100.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let ta: BTreeSet<&str> = a.split_whitespace().collect();
    let tb: BTreeSet<&str> = b.split_whitespace().collect();
    let base = ta.intersection(&tb).copied().collect::<Vec<_>>().join(" ");
    let only_a = ta.difference(&tb).copied().collect::<Vec<_>>().join(" ");
    let only_b = tb.difference(&ta).copied().collect::<Vec<_>>().join(" ");

    let with_a = join_tokens(&base, &only_a);
    let with_b = join_tokens(&base, &only_b);
    ratio(&base, &with_a)
        .max(ratio(&base, &with_b))
        .max(ratio(&with_a, &with_b))
}

fn join_tokens(left: &str, right: &str) -> String {
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{left} {right}"),
    }
}

/// Best alignment of the shorter string against any equal-length window of
/// the longer one (0-100). Catches blacklist terms buried inside titles.
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let (shorter, longer) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let window_len = shorter.chars().count();
    if window_len == 0 {
        return if longer.is_empty() { 100.0 } else { 0.0 };
    }
    let longer_chars: Vec<char> = longer.chars().collect();
    if longer_chars.len() == window_len {
        return ratio(shorter, longer);
    }
    let mut best = 0.0f64;
    for start in 0..=(longer_chars.len() - window_len) {
        let window: String = longer_chars[start..start + window_len].iter().collect();
        best = best.max(ratio(shorter, &window));
    }
    best
}

/// Match cleaned title text against the target models. The best match is
/// accepted only above the category threshold; everything else is the
/// unknown sentinel. Ambiguity is not an error.
pub fn categorize(text: &str, models: &BTreeSet<String>) -> String {
    if text.trim().is_empty() || models.is_empty() {
        return UNKNOWN_CATEGORY.to_string();
    }
    let mut best: Option<(&str, f64)> = None;
    for model in models {
        let score = token_set_ratio(text, model);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((model, score));
        }
    }
    match best {
        Some((model, score)) if score > CATEGORY_THRESHOLD => model.to_string(),
        _ => UNKNOWN_CATEGORY.to_string(),
    }
}

/// Fuzzy blacklist check over cleaned title text.
pub fn is_spam(text: &str, blacklist: &BTreeSet<String>) -> bool {
    if text.trim().is_empty() || blacklist.is_empty() {
        return false;
    }
    blacklist
        .iter()
        .any(|term| partial_ratio(text, term) > SPAM_THRESHOLD)
}

/// Strip currency text down to an integer amount. Empty or non-numeric
/// input maps to 0; already-numeric text passes through unchanged.
pub fn normalize_price(raw: &str) -> i64 {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or_default()
}

/// Stable first-occurrence-wins dedup by an arbitrary key. Idempotent.
pub fn dedupe_by_key<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(key(item))).collect()
}
