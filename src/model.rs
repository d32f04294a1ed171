use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Unix milliseconds, always UTC.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Pending,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Pending => "PENDING",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }

    /// Active bookings occupy their interval. Pending ones included.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "PENDING" => Ok(BookingStatus::Pending),
            "CANCELLED" | "CANCELED" => Ok(BookingStatus::Cancelled),
            _ => Err(UnknownVariant { kind: "booking status", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceCategory {
    Room,
    Vehicle,
    Equipment,
    Other,
}

impl ResourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::Room => "ROOM",
            ResourceCategory::Vehicle => "VEHICLE",
            ResourceCategory::Equipment => "EQUIPMENT",
            ResourceCategory::Other => "OTHER",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ROOM" => Ok(ResourceCategory::Room),
            "VEHICLE" => Ok(ResourceCategory::Vehicle),
            "EQUIPMENT" => Ok(ResourceCategory::Equipment),
            "OTHER" => Ok(ResourceCategory::Other),
            _ => Err(UnknownVariant { kind: "resource category", value: s.to_string() }),
        }
    }
}

/// Resource directory entry. The scheduler only ever uses `id` as a key;
/// `capacity` is a seat count for display, not a concurrency limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub category: ResourceCategory,
    pub capacity: Option<u32>,
    pub location: Option<String>,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub title: String,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// A booking request as handed over by the request layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    /// Server generated when absent.
    pub id: Option<Ulid>,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub title: String,
    pub notes: Option<String>,
    /// `Pending` when the resource requires approval. Decided by the caller.
    pub status: BookingStatus,
}

impl NewBooking {
    pub fn new(resource_id: Ulid, user_id: Ulid, start: Ms, end: Ms, title: impl Into<String>) -> Self {
        Self {
            id: None,
            resource_id,
            user_id,
            start,
            end,
            title: title.into(),
            notes: None,
            status: BookingStatus::Confirmed,
        }
    }

    pub fn with_id(mut self, id: Ulid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_status(mut self, status: BookingStatus) -> Self {
        self.status = status;
        self
    }
}

/// Partial update of a booking. `notes: Some(None)` clears the notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub resource_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub title: Option<String>,
    pub notes: Option<Option<String>>,
}

impl BookingPatch {
    /// True if the patch touches the booking's place on a timeline.
    pub fn touches_schedule(&self) -> bool {
        self.resource_id.is_some() || self.start.is_some() || self.end.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.touches_schedule() && self.title.is_none() && self.notes.is_none()
    }
}

/// Partial update of a directory entry. Nullable columns use `Some(None)`
/// for an explicit NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub category: Option<ResourceCategory>,
    pub capacity: Option<Option<u32>>,
    pub location: Option<Option<String>>,
    pub requires_approval: Option<bool>,
}

impl ResourcePatch {
    pub fn apply_to(self, info: &mut ResourceInfo) {
        if let Some(name) = self.name {
            info.name = name;
        }
        if let Some(category) = self.category {
            info.category = category;
        }
        if let Some(capacity) = self.capacity {
            info.capacity = capacity;
        }
        if let Some(location) = self.location {
            info.location = location;
        }
        if let Some(requires_approval) = self.requires_approval {
            info.requires_approval = requires_approval;
        }
    }
}

/// All bookings of one resource, sorted by `span.start`. Cancelled bookings
/// stay on the timeline as history but never take part in conflicts.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub resource_id: Ulid,
    pub bookings: Vec<Booking>,
}

impl Timeline {
    pub fn new(resource_id: Ulid) -> Self {
        Self {
            resource_id,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping sort order by start. Equal starts keep insertion order.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn has_active(&self) -> bool {
        self.bookings.iter().any(Booking::is_active)
    }

    /// Bookings whose span overlaps the query window, cancelled ones included.
    /// Everything starting at or after `query.end` is skipped by binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Active bookings overlapping `query`, skipping `exclude`.
    pub fn find_overlapping(
        &self,
        query: &Span,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &Booking> {
        self.overlapping(query)
            .filter(move |b| b.is_active() && Some(b.id) != exclude)
    }
}

/// Listing filter. Date bounds select bookings lying within `[from, until]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub resource_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    pub from: Option<Ms>,
    pub until: Option<Ms>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.resource_id.is_none_or(|r| r == b.resource_id)
            && self.user_id.is_none_or(|u| u == b.user_id)
            && self.status.is_none_or(|s| s == b.status)
            && self.from.is_none_or(|t| b.span.start >= t)
            && self.until.is_none_or(|t| b.span.end <= t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

/// A booking joined with what the directory knows about its resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub resource_name: Option<String>,
    pub resource_category: Option<ResourceCategory>,
}

/// Log record format. Flat, one variant per state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered(ResourceInfo),
    ResourceUpdated(ResourceInfo),
    ResourceRemoved {
        id: Ulid,
    },
    BookingCreated(Booking),
    BookingUpdated {
        id: Ulid,
        from_resource: Ulid,
        resource_id: Ulid,
        span: Span,
        title: String,
        notes: Option<String>,
        updated_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
}
