//! Interval and cron triggers: a 1s sleep/shutdown race per tick, with per-trigger overlap
//! suppression instead of a single advisory lock.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Map;
use taskbroker_graceful_shutdown::GracefulShutdownConsumer;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::error::Error;
use crate::registry::Handler;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum Trigger {
    Interval { period: Duration },
    Cron { expression: String, schedule: cron::Schedule },
}

impl Trigger {
    pub fn cron(expression: &str) -> Result<Trigger, Error> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| Error::ScheduleParseError {
            expression: expression.to_string(),
            source: e,
        })?;
        Ok(Trigger::Cron {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn interval(period: Duration) -> Trigger {
        Trigger::Interval { period }
    }

    fn next_run_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { period } => chrono::Duration::from_std(*period)
                .ok()
                .map(|period| now + period),
            Trigger::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }
}

struct ScheduledTrigger {
    name: String,
    trigger: Trigger,
    handler: Arc<dyn Handler>,
    payload: Map<String, serde_json::Value>,
    next_run: Mutex<Option<DateTime<Utc>>>,
    last_run: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
}

/// Holds every registered trigger and drives its tick loop. Triggers are added before
/// [`Scheduler::start`] is called; the scheduler itself never mutates the set of triggers.
#[derive(Default)]
pub struct Scheduler {
    triggers: Vec<Arc<ScheduledTrigger>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        trigger: Trigger,
        handler: Arc<dyn Handler>,
        payload: Map<String, serde_json::Value>,
    ) {
        let next_run = trigger.next_run_from(Utc::now());
        self.triggers.push(Arc::new(ScheduledTrigger {
            name: name.to_string(),
            trigger,
            handler,
            payload,
            next_run: Mutex::new(next_run),
            last_run: Mutex::new(None),
            running: AtomicBool::new(false),
        }));
    }

    pub fn start(self, shutdown: GracefulShutdownConsumer) -> JoinHandle<()> {
        let triggers = self.triggers;
        tokio::spawn(async move {
            let mut shutdown = shutdown;
            loop {
                let now = Utc::now();
                for trigger in &triggers {
                    maybe_fire(trigger.clone(), now);
                }

                tokio::select! {
                    _ = tokio::time::sleep(TICK_INTERVAL) => continue,
                    _ = shutdown.wait_for_shutdown() => break,
                }
            }
        })
    }
}

/// Checks whether `trigger` is due and, if so, spawns its handler as an independent unit so a
/// slow handler never holds up the tick loop or other triggers. Overlap is suppressed via
/// `running`, a single-trigger lock rather than a global one.
fn maybe_fire(trigger: Arc<ScheduledTrigger>, now: DateTime<Utc>) {
    tokio::spawn(async move {
        let due = {
            let next_run = trigger.next_run.lock().await;
            matches!(*next_run, Some(next) if next <= now)
        };
        if !due {
            return;
        }

        if trigger.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let result = trigger.handler.call(trigger.payload.clone()).await;
        if let Err(e) = result {
            event!(Level::ERROR, trigger = %trigger.name, error = %e, "Trigger handler failed");
        }

        let fire_time = Utc::now();
        *trigger.last_run.lock().await = Some(fire_time);
        *trigger.next_run.lock().await = trigger.trigger.next_run_from(fire_time);
        trigger.running.store(false, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::registry::Handler;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use taskbroker_graceful_shutdown::GracefulShutdown;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn call(&self, _kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn interval_trigger_fires_repeatedly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.add(
            "tick",
            Trigger::interval(Duration::from_millis(5)),
            Arc::new(CountingHandler(calls.clone())),
            Map::new(),
        );

        let mut shutdown = GracefulShutdown::new();
        let handle = scheduler.start(shutdown.consumer());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.shutdown();
        let _ = handle.await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn bad_cron_expression_is_rejected_at_registration() {
        let result = Trigger::cron("not a cron expression");
        assert_matches!(result, Err(Error::ScheduleParseError { .. }));
    }
}
