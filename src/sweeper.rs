//! The maintenance sweeper.
//!
//! A single long-lived task that periodically scans the stores and deletes
//! entries whose last-seen timestamp predates the retention cutoff.  Each
//! store can opt out of sweeping, so one instance in a fleet can own
//! maintenance while the others serve only traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::center::Center;
use crate::store::{Entry, Store};

/// Sweep on a timer until the shutdown signal fires.
pub async fn run(center: Arc<Center>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(center.config.daemon.maintenance_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let now = jiff::Timestamp::now().as_second();
        sweep_once(&center, now).await;
    }
}

/// One sweep over every store with maintenance enabled.
pub async fn sweep_once(center: &Center, now: i64) {
    let grey = &center.config.greylist;
    if grey.maintenance {
        sweep_store(&center.greylist, "greylist", now - grey.max_age).await;
    }

    if let Some(awl) = &center.awl {
        let config = center
            .config
            .auto_whitelist
            .as_ref()
            .expect("an open auto-whitelist store implies its configuration");
        if config.maintenance {
            sweep_store(awl, "auto-whitelist", now - config.max_age).await;
        }
    }
}

/// Delete every entry of one store last seen before the cutoff.
async fn sweep_store(store: &Store, what: &str, cutoff: i64) {
    let expired = store.scan(|_, value| {
        Entry::parse(value).is_some_and(|entry| entry.last_seen < cutoff)
    });
    let expired = match expired.await {
        Ok(keys) => keys,
        Err(err) => {
            warn!("Skipping the {what} sweep: {err}");
            return;
        }
    };

    if expired.is_empty() {
        debug!("Swept the {what} store; nothing has expired");
        return;
    }

    let mut removed = 0usize;
    for key in &expired {
        // The serving workers may touch the same keys; a key that is
        // already gone counts as removed.
        match store.delete(key).await {
            Ok(()) => removed += 1,
            Err(err) => warn!("Could not delete expired key '{key}': {err}"),
        }
    }
    if let Err(err) = store.save().await {
        warn!("Could not flush the {what} store after sweeping: {err}");
    }

    info!("Swept the {what} store: {removed} expired entries removed");
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use crate::center::Center;
    use crate::config::Spec;
    use crate::store::Store;
    use crate::whitelist::Whitelists;

    async fn center_with_stores(dir: &tempfile::TempDir, awl_maintenance: bool) -> Center {
        let toml = format!(
            r#"
            [greylist]
            store = "sled://{dir}/grey"
            max-age = 3024000

            [auto-whitelist]
            store = "sled://{dir}/awl"
            max-age = 3024000
            maintenance = {awl_maintenance}
            "#,
            dir = dir.path().display(),
        );
        let config = toml::from_str::<Spec>(&toml).unwrap().parse().unwrap();
        let greylist = Store::open(&config.greylist.store).await.unwrap();
        let awl = Store::open(&config.auto_whitelist.as_ref().unwrap().store)
            .await
            .unwrap();
        Center::new(config, greylist, Some(awl), Whitelists::empty())
    }

    #[tokio::test]
    async fn stale_entries_are_deleted_and_fresh_ones_kept() {
        let dir = tempfile::tempdir().unwrap();
        let center = center_with_stores(&dir, true).await;

        center.greylist.update("stale", "0,500").await.unwrap();
        center.greylist.update("fresh", "2,3999999").await.unwrap();
        // Unparseable values are not the sweeper's to judge.
        center.greylist.update("odd", "what").await.unwrap();

        super::sweep_once(&center, 4_000_000).await;

        assert_eq!(center.greylist.get("stale").await.unwrap(), None);
        assert!(center.greylist.get("fresh").await.unwrap().is_some());
        assert!(center.greylist.get("odd").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disabled_maintenance_leaves_a_store_alone() {
        let dir = tempfile::tempdir().unwrap();
        let center = center_with_stores(&dir, false).await;
        let awl = center.awl.as_ref().unwrap();

        center.greylist.update("stale", "0,500").await.unwrap();
        awl.update("stale", "0,500").await.unwrap();

        super::sweep_once(&center, 4_000_000).await;

        assert_eq!(center.greylist.get("stale").await.unwrap(), None);
        // The auto-whitelist opted out of maintenance on this instance.
        assert!(awl.get("stale").await.unwrap().is_some());
    }
}
