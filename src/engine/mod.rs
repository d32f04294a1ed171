mod conflict;
mod error;
mod mutations;
mod queries;
mod writer;

pub use conflict::{find_conflict, validate_span};
pub use error::SchedulerError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use writer::WalCommand;

pub type SharedTimeline = Arc<RwLock<Timeline>>;

/// Booking scheduler of one organization.
///
/// Every resource timeline sits behind its own write lock, and create/update
/// hold that lock across conflict check, log append and in-memory apply.
/// That is what keeps two overlapping active bookings off one resource even
/// when requests race.
pub struct Engine {
    resources: DashMap<Ulid, ResourceInfo>,
    timelines: DashMap<Ulid, SharedTimeline>,
    /// booking id → resource id of the timeline holding it
    booking_index: DashMap<Ulid, Ulid>,
    /// Serializes resource directory writes.
    directory: Mutex<()>,
    /// Mutations hold it shared while they append; compaction takes it
    /// exclusively so its snapshot cannot miss a concurrent append.
    /// Lock order: gate, then directory, then timelines by ascending id.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the log at `wal_path` and start its writer task.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        Ok(Self::start(wal, &events))
    }

    /// Rebuild state from `events` and hand `wal` to a new writer task.
    fn start(wal: Wal, events: &[Event]) -> Self {
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(writer::run_writer(wal, wal_rx));

        let resources = DashMap::new();
        let booking_index = DashMap::new();
        let mut timelines: HashMap<Ulid, Timeline> = HashMap::new();
        for event in events {
            match event {
                Event::ResourceRegistered(info) | Event::ResourceUpdated(info) => {
                    resources.insert(info.id, info.clone());
                }
                Event::ResourceRemoved { id } => {
                    resources.remove(id);
                }
                other => replay_booking_event(&mut timelines, other, &booking_index),
            }
        }

        let timelines = timelines
            .into_iter()
            .map(|(id, tl)| (id, Arc::new(RwLock::new(tl))))
            .collect();

        Self {
            resources,
            timelines,
            booking_index,
            directory: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
        }
    }

    /// Hand one event to the writer and wait until it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulerError::StoreUnavailable("log writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulerError::StoreUnavailable("log writer dropped response".into()))?
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))
    }

    /// Existing timeline, or none for a resource that was never booked.
    pub(super) fn existing_timeline(&self, resource_id: &Ulid) -> Option<SharedTimeline> {
        self.timelines.get(resource_id).map(|e| e.value().clone())
    }

    /// Timeline for `resource_id`, created atomically on first use.
    pub(super) fn timeline(&self, resource_id: Ulid) -> SharedTimeline {
        self.timelines
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(Timeline::new(resource_id))))
            .value()
            .clone()
    }

    pub(super) fn resource_of(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// Write-lock the source timeline of a booking and, when it moves, the
    /// target too. Acquired in ascending id order.
    pub(super) async fn lock_for_move(
        &self,
        from: Ulid,
        to: Ulid,
    ) -> (
        OwnedRwLockWriteGuard<Timeline>,
        Option<OwnedRwLockWriteGuard<Timeline>>,
    ) {
        let from_tl = self.timeline(from);
        if from == to {
            return (from_tl.write_owned().await, None);
        }
        let to_tl = self.timeline(to);
        if from < to {
            let f = from_tl.write_owned().await;
            let t = to_tl.write_owned().await;
            (f, Some(t))
        } else {
            let t = to_tl.write_owned().await;
            let f = from_tl.write_owned().await;
            (f, Some(t))
        }
    }
}

/// Apply a booking event to the timeline(s) it touches and return the
/// booking's new state. `to` is only set when an update moves the booking
/// to another resource. The caller holds whatever locks guard the timelines.
pub(super) fn apply_booking_event(
    from: &mut Timeline,
    to: Option<&mut Timeline>,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) -> Option<Booking> {
    match event {
        Event::BookingCreated(booking) => {
            index.insert(booking.id, booking.resource_id);
            from.insert(booking.clone());
            Some(booking.clone())
        }
        Event::BookingCancelled { id, at, .. } => {
            let booking = from.get_mut(*id)?;
            booking.status = BookingStatus::Cancelled;
            booking.updated_at = *at;
            Some(booking.clone())
        }
        Event::BookingUpdated {
            id,
            resource_id,
            span,
            title,
            notes,
            updated_at,
            ..
        } => {
            // Remove and reinsert: the start may have moved.
            let mut booking = from.remove(*id)?;
            booking.resource_id = *resource_id;
            booking.span = *span;
            booking.title = title.clone();
            booking.notes = notes.clone();
            booking.updated_at = *updated_at;
            index.insert(*id, *resource_id);
            to.unwrap_or(from).insert(booking.clone());
            Some(booking)
        }
        Event::ResourceRegistered(_) | Event::ResourceUpdated(_) | Event::ResourceRemoved { .. } => {
            None
        }
    }
}

fn replay_booking_event(
    timelines: &mut HashMap<Ulid, Timeline>,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) {
    let (from, to) = match event {
        Event::BookingCreated(b) => (b.resource_id, b.resource_id),
        Event::BookingCancelled { resource_id, .. } => (*resource_id, *resource_id),
        Event::BookingUpdated {
            from_resource,
            resource_id,
            ..
        } => (*from_resource, *resource_id),
        _ => return,
    };
    let mut from_tl = timelines
        .remove(&from)
        .unwrap_or_else(|| Timeline::new(from));
    if from == to {
        apply_booking_event(&mut from_tl, None, event, index);
    } else {
        let to_tl = timelines.entry(to).or_insert_with(|| Timeline::new(to));
        apply_booking_event(&mut from_tl, Some(to_tl), event, index);
    }
    timelines.insert(from, from_tl);
}
