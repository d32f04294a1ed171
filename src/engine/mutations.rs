use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::clock::now_ms;
use crate::limits::*;
use crate::model::*;

use super::conflict::{ensure_no_conflict, validate_notes, validate_span, validate_title};
use super::writer::Control;
use super::{apply_booking_event, Engine, SchedulerError, SharedTimeline, WalCommand};

/// A booking can be moved by a concurrent update between the index lookup
/// and taking its timeline lock; the lookup is then repeated.
const MAX_RELOCK_ATTEMPTS: usize = 8;

fn moved_concurrently(id: Ulid) -> SchedulerError {
    SchedulerError::StoreUnavailable(format!("booking {id} kept moving between resources"))
}

fn validate_resource(info: &ResourceInfo) -> Result<(), SchedulerError> {
    if info.name.trim().is_empty() {
        return Err(SchedulerError::validation("resource name is required"));
    }
    if info.name.len() > MAX_NAME_LEN {
        return Err(SchedulerError::validation("resource name too long"));
    }
    if info.location.as_ref().is_some_and(|l| l.len() > MAX_LOCATION_LEN) {
        return Err(SchedulerError::validation("resource location too long"));
    }
    Ok(())
}

impl Engine {
    // ── Resource directory ───────────────────────────────────

    pub async fn register_resource(&self, info: ResourceInfo) -> Result<(), SchedulerError> {
        validate_resource(&info)?;
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory.lock().await;
        if self.resources.contains_key(&info.id) {
            return Err(SchedulerError::AlreadyExists(info.id));
        }
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(SchedulerError::validation("too many resources"));
        }

        let event = Event::ResourceRegistered(info.clone());
        self.wal_append(&event).await?;
        self.resources.insert(info.id, info);
        Ok(())
    }

    /// Merge `patch` into the current entry. Read, merge and write happen
    /// under the directory lock, so concurrent patches never drop each other.
    pub async fn update_resource(
        &self,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<ResourceInfo, SchedulerError> {
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory.lock().await;
        let mut info = self
            .resources
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(SchedulerError::NotFound(id))?;
        patch.apply_to(&mut info);
        validate_resource(&info)?;

        let event = Event::ResourceUpdated(info.clone());
        self.wal_append(&event).await?;
        self.resources.insert(id, info.clone());
        Ok(info)
    }

    /// Drop a resource from the directory. Refused while it still has an
    /// active booking; cancelled history stays on its timeline.
    pub async fn remove_resource(&self, id: Ulid) -> Result<(), SchedulerError> {
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory.lock().await;
        if !self.resources.contains_key(&id) {
            return Err(SchedulerError::NotFound(id));
        }

        // Held until the directory entry is gone. Bookings check the
        // directory under this same lock, so none can slip in meanwhile.
        let tl = self.timeline(id);
        let guard = tl.write().await;
        if guard.has_active() {
            return Err(SchedulerError::ResourceInUse(id));
        }

        let event = Event::ResourceRemoved { id };
        self.wal_append(&event).await?;
        self.resources.remove(&id);
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Book `[start, end)` on a registered resource unless an active booking
    /// overlaps it. The approval policy is the request layer's business.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, SchedulerError> {
        let span = validate_span(req.start, req.end)?;
        validate_title(&req.title)?;
        validate_notes(req.notes.as_deref())?;
        if !req.status.is_active() {
            return Err(SchedulerError::validation("a new booking cannot be cancelled"));
        }
        let id = req.id.unwrap_or_else(Ulid::new);

        let _gate = self.commit_gate.read().await;
        let tl = self.timeline(req.resource_id);
        let mut guard = tl.write().await;
        if !self.resources.contains_key(&req.resource_id) {
            return Err(SchedulerError::NotFound(req.resource_id));
        }

        ensure_no_conflict(&guard, &span, None)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(SchedulerError::validation("too many bookings on resource"));
        }
        match self.booking_index.entry(id) {
            Entry::Occupied(_) => return Err(SchedulerError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(req.resource_id);
            }
        }

        let now = now_ms();
        let booking = Booking {
            id,
            resource_id: req.resource_id,
            user_id: req.user_id,
            span,
            status: req.status,
            title: req.title,
            notes: req.notes,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated(booking.clone());
        if let Err(e) = self.wal_append(&event).await {
            self.booking_index.remove(&id);
            return Err(e);
        }
        apply_booking_event(&mut guard, None, &event, &self.booking_index);
        tracing::debug!("booked {id} on {} [{}, {})", booking.resource_id, span.start, span.end);
        Ok(booking)
    }

    /// Apply a partial update. Only changes to `start`, `end` or `resource_id`
    /// re-run the conflict check, against every other active booking on the
    /// target resource.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<Booking, SchedulerError> {
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        if let Some(notes) = &patch.notes {
            validate_notes(notes.as_deref())?;
        }
        if let (Some(start), Some(end)) = (patch.start, patch.end) {
            validate_span(start, end)?;
        }

        let _gate = self.commit_gate.read().await;
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let from = self.resource_of(&id).ok_or(SchedulerError::NotFound(id))?;
            let to = patch.resource_id.unwrap_or(from);
            let (mut from_guard, mut to_guard) = self.lock_for_move(from, to).await;

            let Some(current) = from_guard.get(id).cloned() else {
                continue;
            };
            if !current.is_active() {
                return Err(SchedulerError::validation(format!("booking {id} is cancelled")));
            }
            if to_guard.is_some() && !self.resources.contains_key(&to) {
                return Err(SchedulerError::NotFound(to));
            }
            if patch.is_empty() {
                return Ok(current);
            }

            let span = validate_span(
                patch.start.unwrap_or(current.span.start),
                patch.end.unwrap_or(current.span.end),
            )?;
            if patch.touches_schedule() {
                let target = to_guard.as_deref().unwrap_or(&*from_guard);
                ensure_no_conflict(target, &span, Some(id))?;
            }
            if to_guard
                .as_ref()
                .is_some_and(|t| t.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE)
            {
                return Err(SchedulerError::validation("too many bookings on resource"));
            }

            let event = Event::BookingUpdated {
                id,
                from_resource: from,
                resource_id: to,
                span,
                title: patch.title.clone().unwrap_or(current.title),
                notes: patch.notes.clone().unwrap_or(current.notes),
                updated_at: now_ms(),
            };
            self.wal_append(&event).await?;
            return apply_booking_event(
                &mut from_guard,
                to_guard.as_deref_mut(),
                &event,
                &self.booking_index,
            )
            .ok_or(SchedulerError::NotFound(id));
        }
        Err(moved_concurrently(id))
    }

    /// Mark a booking cancelled. Cancelling twice is accepted and returns the
    /// booking as it is, without logging anything.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, SchedulerError> {
        let _gate = self.commit_gate.read().await;
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let resource_id = self.resource_of(&id).ok_or(SchedulerError::NotFound(id))?;
            let tl = self.timeline(resource_id);
            let mut guard = tl.write().await;
            match guard.get(id) {
                None => continue,
                Some(b) if !b.is_active() => return Ok(b.clone()),
                Some(_) => {}
            }

            let event = Event::BookingCancelled {
                id,
                resource_id,
                at: now_ms(),
            };
            self.wal_append(&event).await?;
            return apply_booking_event(&mut guard, None, &event, &self.booking_index)
                .ok_or(SchedulerError::NotFound(id));
        }
        Err(moved_concurrently(id))
    }

    // ── Log maintenance ──────────────────────────────────────

    /// Rewrite the log as a snapshot of the current state: the directory,
    /// then every booking (cancelled ones too) as it stands now. Returns the
    /// number of events written.
    pub async fn compact_wal(&self) -> Result<usize, SchedulerError> {
        let _gate = self.commit_gate.write().await;

        let mut resources: Vec<ResourceInfo> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        resources.sort_by_key(|r| r.id);
        let mut events: Vec<Event> = resources.into_iter().map(Event::ResourceRegistered).collect();

        let timelines: Vec<SharedTimeline> =
            self.timelines.iter().map(|e| e.value().clone()).collect();
        for tl in timelines {
            let guard = tl.read().await;
            events.extend(guard.bookings.iter().cloned().map(Event::BookingCreated));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(Control::Compact { events, response: tx }))
            .await
            .map_err(|_| SchedulerError::StoreUnavailable("log writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulerError::StoreUnavailable("log writer dropped response".into()))?
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Control(Control::AppendsSinceCompact { response: tx }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
