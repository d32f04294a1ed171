use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One engine per organization, keyed by the sanitized database name of the
/// pgwire connection. Each gets its own log file and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily load the engine of an organization.
    pub fn get_or_create(&self, organization: &str) -> io::Result<Arc<Engine>> {
        if organization.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "organization name too long"));
        }

        // Only these characters reach the file system.
        let key = storage_key(organization);
        if key.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty organization name"));
        }
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }

        // Two connections to a new organization race here; the entry lock
        // makes sure only one engine (and one log writer) is started.
        let len = self.engines.len();
        match self.engines.entry(key.clone()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                if len >= MAX_TENANTS {
                    return Err(io::Error::other("too many organizations"));
                }
                let wal_path = self.data_dir.join(format!("{key}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                slot.insert(engine.clone());
                tracing::info!("loaded organization {key}");
                metrics::gauge!(crate::observability::TENANTS_ACTIVE).set((len + 1) as f64);
                Ok(engine)
            }
        }
    }
}

/// Keeps alphanumerics, `_` and `-`; everything else is dropped.
fn storage_key(organization: &str) -> String {
    organization
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn organizations_are_isolated() {
        let tm = TenantManager::new(scratch("isolation"), 1000);
        let a = tm.get_or_create("acme").unwrap();
        let b = tm.get_or_create("globex").unwrap();

        let room = ResourceInfo {
            id: Ulid::new(),
            name: "Boardroom".into(),
            category: ResourceCategory::Room,
            capacity: Some(12),
            location: None,
            requires_approval: false,
        };
        let rid = room.id;
        a.register_resource(room.clone()).await.unwrap();
        a.create_booking(NewBooking::new(rid, Ulid::new(), 1_000, 2_000, "sync"))
            .await
            .unwrap();

        assert!(a.check_conflict(rid, 1_000, 2_000, None).await);
        assert!(!b.check_conflict(rid, 1_000, 2_000, None).await);
        assert!(b.resource(&rid).is_none());
        b.register_resource(room).await.unwrap();
        b.create_booking(NewBooking::new(rid, Ulid::new(), 1_000, 2_000, "sync"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lazy_creation_makes_log_file() {
        let dir = scratch("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = TenantManager::new(scratch("same_engine"), 1000);
        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn name_sanitized() {
        let dir = scratch("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let engine = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Same file, same engine.
        assert!(Arc::ptr_eq(&engine, &tm.get_or_create("evil").unwrap()));

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn name_too_long() {
        let tm = TenantManager::new(scratch("name_too_long"), 1000);
        let err = tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)).err().unwrap();
        assert!(err.to_string().contains("organization name too long"));
    }

    #[tokio::test]
    async fn count_limit() {
        let tm = TenantManager::new(scratch("count_limit"), 1000);
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many organizations"));
    }
}
