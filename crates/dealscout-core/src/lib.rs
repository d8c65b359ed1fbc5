//! Core domain records shared across the deal-scout pipeline.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealscout-core";

/// Category assigned when no target model clears the match threshold.
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Substitute image for detail pages without a usable primary photo.
pub const PLACEHOLDER_IMAGE: &str =
    "https://encrypted-tbn0.gstatic.com/images?q=tbn:ANd9GcRcCBHgbS23kyBw2r8Pquu19UtKZnrZmFUx1g&s";

fn default_true() -> bool {
    true
}

/// Raw handoff from the catalog parser into the cleaning stage.
///
/// The price is still the page text here; a [`ListingRecord`] can only be
/// built with a normalized price, so normalization happens exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSummary {
    pub id: String,
    pub title: String,
    pub link: String,
    pub raw_price: String,
}

/// One marketplace listing as persisted in the durable store.
///
/// `spam` and `is_new` are the only fields whose persisted values survive a
/// re-scrape; everything else is replaced wholesale by the freshest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: String,
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub image_link: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ram: u32,
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub gpu: String,
    #[serde(default)]
    pub disk_capacity: u32,
    #[serde(default)]
    pub spam: bool,
    #[serde(default = "default_true")]
    pub is_new: bool,
}

impl ListingRecord {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        link: impl Into<String>,
        price: i64,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            link: link.into(),
            price,
            category: UNKNOWN_CATEGORY.to_string(),
            place: String::new(),
            date: String::new(),
            image_link: String::new(),
            description: String::new(),
            ram: 0,
            cpu: String::new(),
            gpu: String::new(),
            disk_capacity: 0,
            spam: false,
            is_new: true,
        }
    }

    pub const FIELD_NAMES: &'static [&'static str] = &[
        "id",
        "title",
        "link",
        "price",
        "category",
        "place",
        "date",
        "image_link",
        "description",
        "ram",
        "cpu",
        "gpu",
        "disk_capacity",
        "spam",
        "is_new",
    ];

    /// Read access by field name for the presentation boundary.
    /// Unknown names are rejected here rather than at arbitrary call sites.
    pub fn field_value(&self, name: &str) -> Option<String> {
        let value = match name {
            "id" => self.id.clone(),
            "title" => self.title.clone(),
            "link" => self.link.clone(),
            "price" => self.price.to_string(),
            "category" => self.category.clone(),
            "place" => self.place.clone(),
            "date" => self.date.clone(),
            "image_link" => self.image_link.clone(),
            "description" => self.description.clone(),
            "ram" => self.ram.to_string(),
            "cpu" => self.cpu.clone(),
            "gpu" => self.gpu.clone(),
            "disk_capacity" => self.disk_capacity.to_string(),
            "spam" => self.spam.to_string(),
            "is_new" => self.is_new.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// A listing that cleared the cohort analysis, persisted in the hot-deals
/// store. Flat on purpose: the tabular layer wants one header row, so the
/// listing fields are repeated instead of nested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: String,
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub image_link: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ram: u32,
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub gpu: String,
    #[serde(default)]
    pub disk_capacity: u32,
    #[serde(default)]
    pub spam: bool,
    #[serde(default = "default_true")]
    pub is_new: bool,
    #[serde(default)]
    pub cohort_median: f64,
    #[serde(default)]
    pub cohort_count: u32,
    #[serde(default)]
    pub deal_score: f64,
}

impl DealRecord {
    pub fn from_listing(
        listing: ListingRecord,
        cohort_median: f64,
        cohort_count: u32,
        deal_score: f64,
    ) -> Self {
        Self {
            id: listing.id,
            title: listing.title,
            link: listing.link,
            price: listing.price,
            category: listing.category,
            place: listing.place,
            date: listing.date,
            image_link: listing.image_link,
            description: listing.description,
            ram: listing.ram,
            cpu: listing.cpu,
            gpu: listing.gpu,
            disk_capacity: listing.disk_capacity,
            spam: listing.spam,
            is_new: listing.is_new,
            cohort_median,
            cohort_count,
            deal_score,
        }
    }
}

/// Flag-bearing record contract shared by the listing and hot-deals stores.
///
/// The two persisted stores are instances of the same shape; reconciliation
/// only ever touches `id`, `spam` and `is_new`, so this trait is all the
/// store layer needs to know about a row.
pub trait FlagRecord: Clone {
    fn id(&self) -> &str;
    /// Coerce the id to its canonical string form (trimmed text).
    fn canonicalize_id(&mut self);
    fn spam(&self) -> bool;
    fn set_spam(&mut self, spam: bool);
    fn is_new(&self) -> bool;
    fn set_is_new(&mut self, is_new: bool);
}

impl FlagRecord for ListingRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn canonicalize_id(&mut self) {
        self.id = self.id.trim().to_string();
    }

    fn spam(&self) -> bool {
        self.spam
    }

    fn set_spam(&mut self, spam: bool) {
        self.spam = spam;
    }

    fn is_new(&self) -> bool {
        self.is_new
    }

    fn set_is_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }
}

impl FlagRecord for DealRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn canonicalize_id(&mut self) {
        self.id = self.id.trim().to_string();
    }

    fn spam(&self) -> bool {
        self.spam
    }

    fn set_spam(&mut self, spam: bool) {
        self.spam = spam;
    }

    fn is_new(&self) -> bool {
        self.is_new
    }

    fn set_is_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }
}
