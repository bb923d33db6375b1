//! Core listing model and sync status types for PFS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pfs-core";

/// Whether a listing is offered for sale or for rent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferKind {
    #[default]
    Sale,
    Rent,
}

impl OfferKind {
    /// Classify the feed's `operation` attribute. Anything that is not
    /// recognisably `rent` is treated as a sale.
    pub fn from_operation(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("rent") => Self::Rent,
            _ => Self::Sale,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Rent => "rent",
        }
    }
}

/// Canonical in-memory representation of one feed listing.
///
/// Scalar fields hold the trimmed feed text and are empty when the feed
/// omits them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub price: String,
    pub bedrooms: String,
    pub bathrooms: String,
    pub floor_area: String,
    pub plot_area: String,
    pub floor: String,
    pub fee: String,
    pub property_type: String,
    pub offer: OfferKind,
    pub address: String,
    pub postal_code: String,
    pub latitude: String,
    pub longitude: String,
    pub agent_name: String,
    pub agent_email: String,
    pub agent_phone: String,
    pub amenities: Vec<String>,
    pub images: Vec<String>,
}

impl PropertyRecord {
    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    /// `"lat, lng"` when both coordinates are present.
    pub fn location(&self) -> Option<String> {
        if self.latitude.is_empty() || self.longitude.is_empty() {
            None
        } else {
            Some(format!("{}, {}", self.latitude, self.longitude))
        }
    }
}

/// Internal stage of a sync run.
///
/// Consumers only see the coarse label returned by [`SyncPhase::label`]; the
/// fetch and upsert stages share the `data` band of the progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Fetching,
    Upserting,
    AttachingMedia,
    Archiving,
}

impl SyncPhase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching | Self::Upserting => "data",
            Self::AttachingMedia => "images",
            Self::Archiving => "cleanup",
        }
    }
}

impl Serialize for SyncPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Process-wide view of the importer, handed out as a copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub total_imported: u64,
    pub total_updated: u64,
    pub total_errors: u64,
    pub current_progress: u8,
    pub current_phase: SyncPhase,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn new(next_run: DateTime<Utc>) -> Self {
        Self {
            is_running: false,
            last_run: None,
            next_run,
            total_imported: 0,
            total_updated: 0,
            total_errors: 0,
            current_progress: 0,
            current_phase: SyncPhase::Idle,
            last_error: None,
        }
    }

    /// Raise progress to `value` (capped at 100). Lower values are ignored so
    /// progress never moves backwards within a run.
    pub fn advance_progress(&mut self, value: u8) {
        self.current_progress = self.current_progress.max(value.min(100));
    }

    pub fn schedule(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            next_run: self.next_run,
            last_run: self.last_run,
            is_running: self.is_running,
            current_progress: self.current_progress,
            current_phase: self.current_phase,
        }
    }
}

/// Timing-focused subset of [`SyncStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSnapshot {
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub current_progress: u8,
    pub current_phase: SyncPhase,
}

/// Outcome of one completed sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_records: usize,
    pub imported: u64,
    pub updated: u64,
    pub errors: u64,
    pub archived: usize,
}
