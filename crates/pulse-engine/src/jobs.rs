//! The seven standing jobs and their handlers. Each handler catches its
//! own failures: an error is a logged tick failure, never a scheduler
//! crash, and the next tick retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use futures_util::future::join_all;
use tracing::{error, warn};

use pulse_core::config::TRIGGER_RETIRE_HOURS;
use pulse_core::types::Temperature;

use crate::briefing::BriefingService;
use crate::detector::TradeDetector;
use crate::patrol::PatrolService;
use crate::positions::PositionMonitor;
use crate::scheduler::{Cadence, Handler, JobSpec, Scheduler};
use crate::services::Services;
use crate::streams::StreamManager;
use crate::trigger::TriggerEngine;

/// Register the full monitoring job set on a scheduler.
pub fn register_all(scheduler: &Scheduler, services: &Services) {
    let monitor = services.monitor;

    scheduler.register(JobSpec {
        name: "trade-poll",
        cadence: Cadence::Interval(monitor.trade_poll_interval),
        grace_secs: 60,
        handler: handler(services, run_trade_poll),
    });

    // Every Nth hot cycle also polls the warm set.
    let warm_every = (monitor.warm_poll_interval / monitor.hot_poll_interval).max(1);
    let cycle = Arc::new(AtomicU64::new(0));
    let base_services = services.clone();
    let base_handler: Handler =
        Arc::new(move || -> futures_util::future::BoxFuture<'static, ()> {
            let services = base_services.clone();
            let cycle = cycle.clone();
            Box::pin(async move {
                let count = cycle.fetch_add(1, Ordering::SeqCst) + 1;
                let include_warm = count % warm_every == 0;
                run_base_poll(services, include_warm).await;
            })
        });
    scheduler.register(JobSpec {
        name: "base-hot-poll",
        cadence: Cadence::Interval(monitor.hot_poll_interval),
        grace_secs: 30,
        handler: base_handler,
    });

    scheduler.register(JobSpec {
        name: "patrol",
        cadence: Cadence::Interval(monitor.patrol_interval_seconds),
        grace_secs: 300,
        handler: handler(services, run_patrol),
    });

    // Independent of patrol so it runs even for users patrol skips.
    scheduler.register(JobSpec {
        name: "temperature-mgmt",
        cadence: Cadence::Interval(3600),
        grace_secs: 300,
        handler: handler(services, run_temperature_management),
    });

    scheduler.register(JobSpec {
        name: "signal-count-reset",
        cadence: Cadence::Cron("0 0 * * *".to_string()),
        grace_secs: 600,
        handler: handler(services, run_signal_count_reset),
    });

    scheduler.register(JobSpec {
        name: "trigger-cleanup",
        cadence: Cadence::Interval(3600),
        grace_secs: 300,
        handler: handler(services, run_trigger_cleanup),
    });

    scheduler.register(JobSpec {
        name: "daily-briefing",
        cadence: Cadence::Interval(300),
        grace_secs: 300,
        handler: handler(services, run_daily_briefing),
    });
}

fn handler<F, Fut>(services: &Services, job: F) -> Handler
where
    F: Fn(Services) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let services = services.clone();
    Arc::new(move || -> futures_util::future::BoxFuture<'static, ()> {
        Box::pin(job(services.clone()))
    })
}

/// Trade detection sweep: sequential per user (ordered message log),
/// concurrent across users.
pub async fn run_trade_poll(services: Services) {
    let users = match services.store.monitored_users() {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "monitored user listing failed");
            return;
        }
    };

    let tasks = users.into_iter().map(|user| {
        let services = services.clone();
        async move {
            let detector = TradeDetector::new(services.clone());
            if let Err(e) = detector.poll_user(&user).await {
                error!(user_id = user.id, error = %e, "trade poll failed");
            }
            if let Err(e) = detector.detect_closes(&user).await {
                error!(user_id = user.id, error = %e, "close detection failed");
            }
            let monitor = PositionMonitor::new(services);
            if let Err(e) = monitor.monitor_user(&user).await {
                error!(user_id = user.id, error = %e, "position monitoring failed");
            }
        }
    });
    join_all(tasks).await;
}

/// Hot (and periodically warm) stream poll, then trigger evaluation per
/// monitored user over the fresh snapshot.
pub async fn run_base_poll(services: Services, include_warm: bool) {
    let streams = StreamManager::new(services.clone());
    if let Err(e) = streams.poll_temperature(Temperature::Hot).await {
        error!(error = %e, "hot poll failed");
    }
    if include_warm {
        if let Err(e) = streams.poll_temperature(Temperature::Warm).await {
            error!(error = %e, "warm poll failed");
        }
    }

    let users = match services.store.monitored_users() {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "monitored user listing failed");
            return;
        }
    };
    for user in users {
        let snapshot = match streams.hot_snapshot(user.id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(user_id = user.id, error = %e, "hot snapshot failed");
                continue;
            }
        };
        if snapshot.is_empty() {
            continue;
        }
        let engine = TriggerEngine::new(services.clone());
        if let Err(e) = engine.evaluate_all(&user, &snapshot).await {
            error!(user_id = user.id, error = %e, "trigger evaluation failed");
        }
    }
}

pub async fn run_patrol(services: Services) {
    let users = match services.store.monitored_users() {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "monitored user listing failed");
            return;
        }
    };
    let patrol = PatrolService::new(services.clone());
    for user in users {
        if patrol.should_skip(&user) {
            continue;
        }
        if let Err(e) = patrol.run_patrol(&user).await {
            error!(user_id = user.id, error = %e, "patrol failed");
        }
    }
}

/// Demotes streams for every user, monitored or not — lifecycle upkeep
/// does not depend on activity.
pub async fn run_temperature_management(services: Services) {
    let users = match services.store.monitored_users() {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "monitored user listing failed");
            return;
        }
    };
    let streams = StreamManager::new(services.clone());
    for user in users {
        if let Err(e) = streams.auto_transition(user.id) {
            error!(user_id = user.id, error = %e, "temperature transition failed");
        }
    }
}

pub async fn run_signal_count_reset(services: Services) {
    let now = services.clock.now_utc();
    match services.store.reset_all_signal_counts(now) {
        Ok(count) => {
            if count > 0 {
                tracing::info!(count, "daily signal counts reset");
            }
        }
        Err(e) => error!(error = %e, "signal count reset failed"),
    }
}

/// Retire system-created triggers older than the 72-hour budget.
pub async fn run_trigger_cleanup(services: Services) {
    let cutoff = services.clock.now_utc() - Duration::hours(TRIGGER_RETIRE_HOURS);
    match services.store.retire_stale_auto_triggers(cutoff) {
        Ok(count) => {
            if count > 0 {
                tracing::info!(count, "stale auto triggers retired");
            }
        }
        Err(e) => error!(error = %e, "trigger cleanup failed"),
    }
}

pub async fn run_daily_briefing(services: Services) {
    let briefing = BriefingService::new(services.clone());
    let due = match briefing.due_users() {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "briefing user listing failed");
            return;
        }
    };
    for user in due {
        if let Err(e) = briefing.send_briefing(&user).await {
            warn!(user_id = user.id, error = %e, "briefing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::Scheduler;
    use crate::testutil::harness;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn all_seven_jobs_register() {
        let h = harness();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap(),
        ));
        let scheduler = Scheduler::new(clock);
        register_all(&scheduler, &h.services);
        // A tick on a fresh registry fires nothing and panics nowhere.
        scheduler.tick();
    }

    #[tokio::test]
    async fn base_poll_updates_values_and_caches_hot() {
        let h = harness();
        let user = crate::testutil::monitored_user(&h.services, "u-1");
        let now = h.services.clock.now_utc();
        let stream = h
            .services
            .store
            .upsert_stream(user.id, "price", Some("BTC"), None, now)
            .unwrap();
        h.market.put(
            "price",
            Some("BTC"),
            serde_json::json!({"last": 100000.0, "change_24h_pct": 0.5}),
        );

        run_base_poll(h.services.clone(), false).await;

        let updated = h.services.store.stream(stream.id).unwrap();
        assert_eq!(updated.last_value.unwrap()["last"], 100000.0);

        let cached = h
            .services
            .cache
            .get(&pulse_cache::stream_key(user.id, "price", Some("BTC")))
            .await
            .unwrap();
        assert_eq!(cached["last"], 100000.0);
    }
}
