use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

const MATERIALIZER_INTERVAL: Duration = Duration::from_secs(300);
const COMPACTOR_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that keeps every owner's bookable window filled: each
/// tick expands templates over a rolling horizon from now. Materialization
/// is idempotent, so overlapping with on-demand runs is harmless.
pub async fn run_materializer(engine: Arc<Engine>, horizon_ms: Ms) {
    let mut interval = tokio::time::interval(MATERIALIZER_INTERVAL);
    loop {
        interval.tick().await;
        materialize_all(&engine, horizon_ms).await;
    }
}

/// One materializer sweep over all owners. A failing owner does not stop
/// the sweep.
pub async fn materialize_all(engine: &Engine, horizon_ms: Ms) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms;
    for owner_id in engine.owner_ids() {
        match engine.materialize_range(owner_id, now, now + horizon_ms).await {
            Ok(0) => {}
            Ok(n) => info!("materialized {n} slots for owner {owner_id}"),
            Err(e) => tracing::debug!("materializer skip {owner_id}: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACTOR_INTERVAL);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await > threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, DAY_MS, HOUR_MS};
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("atelier_test_upkeep");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_fills_rolling_horizon() {
        let path = test_wal_path("sweep.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let owner_id = Ulid::new();
        let actor = Actor::owner(owner_id);
        engine
            .create_owner(&actor, owner_id, None, HOUR_MS, true)
            .await
            .unwrap();
        // Open every day so the horizon always contains candidates.
        for day in 0..7 {
            engine
                .set_template(&actor, owner_id, day, true, 9 * HOUR_MS, 11 * HOUR_MS)
                .await
                .unwrap();
        }

        materialize_all(&engine, 7 * DAY_MS).await;
        let after_first = engine.list_slots(owner_id, None, false).await.unwrap().len();
        // 2 slots per day over a 7-day horizon; today's may already be past.
        assert!(after_first >= 12, "expected at least 12 slots, got {after_first}");

        // A second sweep over the same horizon is idempotent.
        materialize_all(&engine, 7 * DAY_MS).await;
        let after_second = engine.list_slots(owner_id, None, false).await.unwrap().len();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn sweep_skips_failing_owner_and_continues() {
        let path = test_wal_path("sweep_continue.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let actor_a = Actor::owner(Ulid::new());
        let actor_b = Actor::owner(Ulid::new());
        engine
            .create_owner(&actor_a, actor_a.id, None, HOUR_MS, false)
            .await
            .unwrap();
        engine
            .create_owner(&actor_b, actor_b.id, None, HOUR_MS, false)
            .await
            .unwrap();
        engine
            .set_template(&actor_b, actor_b.id, 1, true, 8 * HOUR_MS, 10 * HOUR_MS)
            .await
            .unwrap();

        // Owner A has no templates — produces nothing, breaks nothing.
        materialize_all(&engine, 14 * DAY_MS).await;
        assert!(engine.list_slots(actor_a.id, None, false).await.unwrap().is_empty());
        assert!(!engine.list_slots(actor_b.id, None, false).await.unwrap().is_empty());
    }
}
