//! Process-global component health, surfaced at `GET /health`.
//! Components: gateway, mysql, apply, backup.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub ok: bool,
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

struct HealthRegistry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

static REGISTRY: OnceLock<HealthRegistry> = OnceLock::new();

fn registry() -> &'static HealthRegistry {
    REGISTRY.get_or_init(|| HealthRegistry {
        started_at: Instant::now(),
        components: Mutex::new(BTreeMap::new()),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn upsert_component<F>(component: &str, update: F)
where
    F: FnOnce(&mut ComponentHealth),
{
    if let Ok(mut map) = registry().components.lock() {
        let now = now_rfc3339();
        let entry = map
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                status: "starting".into(),
                updated_at: now.clone(),
                last_ok: None,
                last_error: None,
                last_duration_ms: None,
            });
        update(entry);
        entry.updated_at = now;
    }
}

pub fn mark_component_ok(component: &str) {
    upsert_component(component, |entry| {
        entry.status = "ok".into();
        entry.last_ok = Some(now_rfc3339());
        entry.last_error = None;
    });
}

/// Like `mark_component_ok`, recording how long the operation ran.
pub fn mark_component_ok_timed(component: &str, duration: Duration) {
    upsert_component(component, |entry| {
        entry.status = "ok".into();
        entry.last_ok = Some(now_rfc3339());
        entry.last_error = None;
        entry.last_duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    });
}

#[allow(clippy::needless_pass_by_value)]
pub fn mark_component_error(component: &str, error: impl ToString) {
    let err = error.to_string();
    upsert_component(component, move |entry| {
        entry.status = "error".into();
        entry.last_error = Some(err);
    });
}

fn overall_ok(components: &BTreeMap<String, ComponentHealth>) -> bool {
    components.values().all(|c| c.status != "error")
}

pub fn snapshot() -> HealthSnapshot {
    let components = registry()
        .components
        .lock()
        .map_or_else(|_| BTreeMap::new(), |map| map.clone());

    HealthSnapshot {
        ok: overall_ok(&components),
        pid: std::process::id(),
        updated_at: now_rfc3339(),
        uptime_seconds: registry().started_at.elapsed().as_secs(),
        components,
    }
}

pub fn snapshot_json() -> serde_json::Value {
    serde_json::to_value(snapshot()).unwrap_or_else(|_| {
        serde_json::json!({
            "status": "error",
            "message": "failed to serialize health snapshot"
        })
    })
}

/// Serializes tests that mark and then assert on a shared registry
/// component; the registry is process-global and tests run in parallel.
#[cfg(test)]
pub(crate) fn component_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static COMPONENT_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    COMPONENT_TEST_LOCK
        .lock()
        .expect("component test lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(status: &str) -> ComponentHealth {
        ComponentHealth {
            status: status.into(),
            updated_at: now_rfc3339(),
            last_ok: None,
            last_error: None,
            last_duration_ms: None,
        }
    }

    #[test]
    fn overall_ok_with_no_components() {
        assert!(overall_ok(&BTreeMap::new()));
    }

    #[test]
    fn overall_ok_fails_on_any_error() {
        let mut map = BTreeMap::new();
        map.insert("gateway".to_string(), component("ok"));
        map.insert("backup".to_string(), component("error"));
        assert!(!overall_ok(&map));
    }

    #[test]
    fn starting_component_does_not_fail_overall() {
        let mut map = BTreeMap::new();
        map.insert("apply".to_string(), component("starting"));
        assert!(overall_ok(&map));
    }

    #[test]
    fn timed_ok_records_duration() {
        // Unique name keeps parallel tests from clashing on the registry.
        mark_component_ok_timed("test_timed_ok", Duration::from_millis(1500));
        let snap = snapshot();
        let entry = &snap.components["test_timed_ok"];
        assert_eq!(entry.status, "ok");
        assert_eq!(entry.last_duration_ms, Some(1500));
    }
}
