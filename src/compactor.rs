use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::observability::COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites an organization's log once enough appends
/// have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            info!("compacted log: {appends} appends folded into {events} events");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            tracing::error!("log compaction failed: {e}");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();
        let rid = Ulid::new();
        engine
            .register_resource(ResourceInfo {
                id: rid,
                name: "Desk 12".into(),
                category: ResourceCategory::Equipment,
                capacity: None,
                location: None,
                requires_approval: false,
            })
            .await
            .unwrap();

        let b = engine
            .create_booking(NewBooking::new(rid, Ulid::new(), 1_000, 2_000, "sync"))
            .await
            .unwrap();
        assert!(!compact_if_due(&engine, 3).await);

        engine.cancel_booking(b.id).await.unwrap();
        engine
            .create_booking(NewBooking::new(rid, Ulid::new(), 1_000, 2_000, "sync"))
            .await
            .unwrap();
        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Compacted file replays to the same state.
        drop(engine);
        let engine = Engine::new(path).unwrap();
        let view = engine.get_booking(&b.id).await.unwrap();
        assert_eq!(view.booking.status, BookingStatus::Cancelled);
        assert!(engine.check_conflict(rid, 1_000, 2_000, None).await);
    }
}
