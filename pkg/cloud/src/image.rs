use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("no image matching tags {0} found")]
    NoImage(String),
}

/// A candidate boot image as listed by the cloud provider.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: String,
    pub name: String,
}

/// Provenance of a cell-agent OS image, encoded in its name as a
/// dash-separated five-tuple: `company-product-version-date-time`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootImageTags {
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
}

impl BootImageTags {
    /// Parse tags from an image name, taking at most five `-` fields.
    pub fn set(&mut self, s: &str) {
        let fields: Vec<&str> = s.split('-').collect();
        if let Some(v) = fields.first() {
            self.company = v.to_string();
        }
        if let Some(v) = fields.get(1) {
            self.product = v.to_string();
        }
        if let Some(v) = fields.get(2) {
            self.version = v.to_string();
        }
        if let Some(v) = fields.get(3) {
            self.date = v.to_string();
        }
        if let Some(v) = fields.get(4) {
            self.time = v.to_string();
        }
    }

    pub fn from_name(s: &str) -> Self {
        let mut tags = Self::default();
        tags.set(s);
        tags
    }

    /// Every non-empty field in `filter` must equal ours.
    pub fn matches(&self, filter: &BootImageTags) -> bool {
        if !filter.company.is_empty() && self.company != filter.company {
            return false;
        }
        if !filter.product.is_empty() && self.product != filter.product {
            return false;
        }
        if !filter.version.is_empty() && self.version != filter.version {
            return false;
        }
        if !filter.date.is_empty() && self.date != filter.date {
            return false;
        }
        if !filter.time.is_empty() && self.time != filter.time {
            return false;
        }
        true
    }

    /// Decimal parse of the version field; unparsable versions sort as 0.
    pub fn version_number(&self) -> u64 {
        self.version.parse().unwrap_or(0)
    }

    /// Creation timestamp parsed as `YYYYMMDD HHMMSS`; really old images
    /// may have none, those sort as epoch zero.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let s = format!("{} {}", self.date, self.time);
        NaiveDateTime::parse_from_str(&s, "%Y%m%d %H%M%S")
            .map(|dt| dt.and_utc())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl std::fmt::Display for BootImageTags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.company, self.product, self.version, self.date, self.time
        )
    }
}

/// Keep only the images whose name matches the tag filter.
pub fn filter_images(images: &[Image], filter: &BootImageTags) -> Vec<Image> {
    images
        .iter()
        .filter(|img| {
            let tags = BootImageTags::from_name(&img.name);
            let ok = tags.matches(filter);
            if ok {
                debug!("Image {} matches filter {}", img.name, filter);
            }
            ok
        })
        .cloned()
        .collect()
}

/// Sort by version then creation timestamp, both ascending; the newest
/// image ends up last.
pub fn sort_images(images: &mut [Image]) {
    images.sort_by_key(|img| {
        let tags = BootImageTags::from_name(&img.name);
        (tags.version_number(), tags.timestamp())
    });
}

/// Resolve the newest image matching the filter.
pub fn best_image(images: &[Image], filter: &BootImageTags) -> Result<String, ImageError> {
    let mut matching = filter_images(images, filter);
    sort_images(&mut matching);
    match matching.last() {
        Some(img) => Ok(img.id.clone()),
        None => Err(ImageError::NoImage(filter.to_string())),
    }
}
