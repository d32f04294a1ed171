use chrono_tz::Tz;
use ulid::Ulid;

use crate::clock::day_window;
use crate::limits::*;
use crate::model::*;

use super::{Engine, SharedTimeline};

fn by_start_then_id(a: &Booking, b: &Booking) -> std::cmp::Ordering {
    a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id))
}

impl Engine {
    pub fn resource(&self, id: &Ulid) -> Option<ResourceInfo> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Every registered resource, ordered by id.
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out: Vec<ResourceInfo> = self.resources.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    fn view(&self, booking: Booking) -> BookingView {
        let info = self.resources.get(&booking.resource_id);
        BookingView {
            resource_name: info.as_ref().map(|r| r.name.clone()),
            resource_category: info.as_ref().map(|r| r.category),
            booking,
        }
    }

    /// Arcs are cloned out first so no map shard stays locked across an await.
    fn timeline_snapshot(&self, only: Option<Ulid>) -> Vec<SharedTimeline> {
        match only {
            Some(id) => self.existing_timeline(&id).into_iter().collect(),
            None => self.timelines.iter().map(|e| e.value().clone()).collect(),
        }
    }

    async fn collect(&self, only: Option<Ulid>, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut out = Vec::new();
        for tl in self.timeline_snapshot(only) {
            let guard = tl.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        out.sort_by(by_start_then_id);
        out
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<BookingView> {
        let resource_id = self.resource_of(id)?;
        let tl = self.existing_timeline(&resource_id)?;
        let booking = tl.read().await.get(*id).cloned()?;
        Some(self.view(booking))
    }

    /// Non-cancelled bookings of one user, earliest first.
    pub async fn user_bookings(&self, user_id: Ulid) -> Vec<BookingView> {
        self.collect(None, |b| b.user_id == user_id && b.is_active())
            .await
            .into_iter()
            .map(|b| self.view(b))
            .collect()
    }

    /// Confirmed bookings starting on the local day of `now` in `tz`.
    pub async fn today_bookings(&self, now: Ms, tz: Tz) -> Vec<BookingView> {
        let day = day_window(now, tz);
        self.collect(None, |b| {
            b.status == BookingStatus::Confirmed && day.contains_instant(b.span.start)
        })
        .await
        .into_iter()
        .map(|b| self.view(b))
        .collect()
    }

    /// Filtered listing ordered by start then id. The page size is capped at
    /// `MAX_PAGE_SIZE`.
    pub async fn list_bookings(&self, filter: &BookingFilter, page: Page) -> Vec<BookingView> {
        let limit = page.limit.min(MAX_PAGE_SIZE);
        self.collect(filter.resource_id, |b| filter.matches(b))
            .await
            .into_iter()
            .skip(page.offset)
            .take(limit)
            .map(|b| self.view(b))
            .collect()
    }
}
