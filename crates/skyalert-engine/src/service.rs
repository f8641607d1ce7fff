//! The alert service facade — everything collaborators call.
//!
//! Owns the durable stores, the weather cache and the scheduler handle,
//! and exposes the external surface: start/stop, run-now, approve/reject,
//! pending notifications and the destructive queue reset.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use skyalert_core::config::{Paths, Settings, Snapshot};
use skyalert_core::error::{Result, SkyAlertError};
use skyalert_core::types::{Notification, RegionForecast};
use skyalert_mailer::transport::{MailTransport, SmtpMailer, UnconfiguredTransport};
use skyalert_store::{DeliveryLog, HealthLog, MailStore, PendingStage};
use skyalert_weather::{DEFAULT_TTL_SECS, WeatherCache, WeatherClient, fetch_all_regions};

use crate::approval;
use crate::cycle::{CycleReport, evaluate_candidates, process_candidates};
use crate::scheduler::{
    CYCLE_ERROR_BACKOFF, Scheduler, next_wake, sleep_for_or_stop, sleep_until_or_stop,
};

pub struct AlertService {
    paths: Paths,
    store: MailStore,
    delivery_log: DeliveryLog,
    staging: PendingStage,
    health: HealthLog,
    cache: WeatherCache,
    scheduler: tokio::sync::Mutex<Scheduler>,
}

impl AlertService {
    /// Open all durable state under the data directory.
    pub fn open(paths: Paths) -> Result<Arc<Self>> {
        paths.ensure()?;
        let store = MailStore::open(&paths.queue_db())?;
        let delivery_log = DeliveryLog::new(paths.delivery_log_file(), paths.backup_dir());
        let staging = PendingStage::new(paths.staging_file(), paths.backup_dir());
        let health = HealthLog::new(paths.health_file());
        let cache = WeatherCache::open(&paths.cache_db(), DEFAULT_TTL_SECS)?;
        Ok(Arc::new(Self {
            paths,
            store,
            delivery_log,
            staging,
            health,
            cache,
            scheduler: tokio::sync::Mutex::new(Scheduler::new()),
        }))
    }

    // ─── Scheduler surface ────────────────────────────────

    /// Start the background loop. Rejected while a loop is active; restart
    /// requires a successful `stop` first.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        let service = Arc::clone(self);
        scheduler.launch(move |stop| run_loop(service, stop))
    }

    /// Signal the loop and wait (bounded) for it to exit.
    pub async fn stop(&self) -> Result<()> {
        self.scheduler.lock().await.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_running()
    }

    // ─── Cycle surface ────────────────────────────────────

    /// Run one evaluation cycle immediately. Returns the candidate count.
    pub async fn run_cycle_now(&self) -> Result<usize> {
        self.run_cycle(false).await.map(|r| r.candidates)
    }

    /// Same pipeline with the test flag carried through payloads, tasks
    /// and log entries.
    pub async fn run_test_cycle(&self) -> Result<usize> {
        self.run_cycle(true).await.map(|r| r.candidates)
    }

    async fn run_cycle(&self, is_test: bool) -> Result<CycleReport> {
        let settings = Settings::load(&self.paths.settings_file())?;
        let snapshot = Snapshot::load(&self.paths)?;
        let regions = snapshot.regions();
        if regions.is_empty() {
            tracing::info!("No subscriber regions configured, nothing to evaluate");
            return Ok(CycleReport::default());
        }

        let client = WeatherClient::new(&settings.weather_api_key);
        let outcome =
            fetch_all_regions(&client, &self.cache, &self.health, &regions, &settings).await;
        if outcome.regions.is_empty() {
            return Err(SkyAlertError::Weather(
                "no weather data for any region".into(),
            ));
        }

        // An incomplete mail config must not block evaluation: candidates
        // still stage, and failed sends stay visible in task status.
        let transport: Box<dyn MailTransport> =
            match SmtpMailer::from_settings(&settings, self.paths.attachments_dir()) {
                Ok(mailer) => {
                    Box::new(mailer.with_health(HealthLog::new(self.paths.health_file())))
                }
                Err(e) => {
                    tracing::warn!("⚠️ Mail transport unavailable: {e}");
                    Box::new(UnconfiguredTransport)
                }
            };
        self.process_cycle(&settings, &snapshot, &outcome.regions, transport.as_ref(), is_test)
            .await
    }

    /// The network-free tail of a cycle, fed with prefetched forecasts.
    pub async fn process_cycle(
        &self,
        settings: &Settings,
        snapshot: &Snapshot,
        weather: &HashMap<String, RegionForecast>,
        transport: &dyn MailTransport,
        is_test: bool,
    ) -> Result<CycleReport> {
        let today = Local::now().date_naive();
        let candidates = evaluate_candidates(weather, snapshot, settings, today);
        tracing::info!("Detected {} alert candidate(s)", candidates.len());
        process_candidates(
            &self.store,
            &self.delivery_log,
            &self.staging,
            transport,
            settings,
            &snapshot.templates,
            candidates,
            is_test,
        )
        .await
    }

    // ─── Approval surface ─────────────────────────────────

    pub async fn approve(&self, notification_id: &str) -> Result<()> {
        let settings = Settings::load(&self.paths.settings_file())?;
        let transport = SmtpMailer::from_settings(&settings, self.paths.attachments_dir())?
            .with_health(HealthLog::new(self.paths.health_file()));
        self.approve_with(&transport, notification_id).await
    }

    /// Approve through an explicit transport (tests, alternate relays).
    pub async fn approve_with(
        &self,
        transport: &dyn MailTransport,
        notification_id: &str,
    ) -> Result<()> {
        approval::approve(
            &self.store,
            &self.delivery_log,
            &self.staging,
            transport,
            notification_id,
        )
        .await
    }

    pub async fn reject(&self, notification_id: &str) -> Result<()> {
        approval::reject(&self.store, &self.staging, notification_id).await
    }

    pub fn pending_notifications(&self) -> Result<Vec<Notification>> {
        self.store.pending_notifications()
    }

    // ─── Administration ───────────────────────────────────

    /// Destructive operator reset: drops every queued task and
    /// notification and truncates the staging file.
    pub fn clear_queues(&self) -> Result<(usize, usize)> {
        let removed = self.store.clear_queues()?;
        self.staging.clear()?;
        tracing::info!(
            "🧹 Queues cleared: {} task(s), {} notification(s)",
            removed.0,
            removed.1
        );
        Ok(removed)
    }

    /// Drop expired weather cache rows.
    pub fn clean_expired_cache(&self) -> Result<usize> {
        self.cache.clear_expired()
    }
}

/// The long-lived loop: re-derive the next wake from fresh settings each
/// round, sleep interruptibly, run one cycle, and survive cycle errors
/// with a fixed backoff. Only the stop flag ends it.
async fn run_loop(service: Arc<AlertService>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let settings = match Settings::load(&service.paths.settings_file()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("❌ Cannot load settings: {e}");
                if !sleep_for_or_stop(&stop, CYCLE_ERROR_BACKOFF).await {
                    break;
                }
                continue;
            }
        };

        let wake = next_wake(
            Local::now().naive_local(),
            settings.first_alert(),
            settings.interval_hours(),
        );
        tracing::info!("⏰ Next evaluation at {wake}");
        if !sleep_until_or_stop(&stop, wake).await {
            break;
        }

        match service.run_cycle(false).await {
            Ok(report) => tracing::info!(
                "✅ Cycle complete: {} candidate(s), {} staged, {} duplicate(s)",
                report.candidates,
                report.staged,
                report.duplicates
            ),
            Err(e) => {
                tracing::error!("❌ Cycle failed: {e}");
                if !sleep_for_or_stop(&stop, CYCLE_ERROR_BACKOFF).await {
                    break;
                }
            }
        }
    }
    tracing::info!("Alert loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skyalert_core::types::{
        AlertRule, Customer, DeliveryStatus, ForecastPoint, MailPayload, Template,
    };
    use std::sync::Mutex;

    struct MockTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailTransport for MockTransport {
        async fn send(&self, to: &str, _s: &str, _b: &str, _a: &[String]) -> Result<()> {
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    fn service(name: &str) -> Arc<AlertService> {
        let dir = std::env::temp_dir().join("skyalert-service-test").join(name);
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        AlertService::open(Paths::new(dir)).unwrap()
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            customers: vec![Customer {
                name: "张三".into(),
                email: "zhang@x.com".into(),
                region: "北京".into(),
                category: "客户".into(),
                weather_types: vec!["高温".into()],
                ..Default::default()
            }],
            rules: vec![AlertRule {
                id: 1,
                weather_type: "高温".into(),
                condition: "温度 >= 35".into(),
                advance_days: Some(1),
                status: "活跃".into(),
                ..Default::default()
            }],
            templates: vec![Template {
                weather_type: "高温".into(),
                subject: "高温预警".into(),
                content: "{{name}}，注意防暑。".into(),
                ..Default::default()
            }],
        }
    }

    fn weather() -> HashMap<String, RegionForecast> {
        let today = Local::now().date_naive();
        HashMap::from([(
            "北京".to_string(),
            RegionForecast {
                region: "北京".into(),
                update_time: String::new(),
                forecasts: (0..3)
                    .map(|i| ForecastPoint {
                        date: today + chrono::Days::new(i),
                        temp_max: Some(36.0),
                        ..Default::default()
                    })
                    .collect(),
            },
        )])
    }

    #[tokio::test]
    async fn full_auto_cycle_through_the_facade() {
        let svc = service("auto-cycle");
        let settings: Settings =
            serde_json::from_str(r#"{"autoApproval": true}"#).unwrap();
        let transport = MockTransport {
            sent: Mutex::new(Vec::new()),
        };

        let report = svc
            .process_cycle(&settings, &snapshot(), &weather(), &transport, false)
            .await
            .unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.dispatch.unwrap().sent, 1);
        assert_eq!(transport.sent.lock().unwrap().as_slice(), ["zhang@x.com"]);
    }

    #[tokio::test]
    async fn manual_cycle_then_approve_via_facade() {
        let svc = service("manual-cycle");
        let settings: Settings = serde_json::from_str("{}").unwrap();
        let transport = MockTransport {
            sent: Mutex::new(Vec::new()),
        };

        svc.process_cycle(&settings, &snapshot(), &weather(), &transport, false)
            .await
            .unwrap();
        let pending = svc.pending_notifications().unwrap();
        assert_eq!(pending.len(), 1);

        svc.approve_with(&transport, &pending[0].notification_id)
            .await
            .unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert!(svc.pending_notifications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_cycle_is_deduplicated() {
        let svc = service("dedup-cycle");
        let settings: Settings =
            serde_json::from_str(r#"{"autoApproval": true}"#).unwrap();
        let transport = MockTransport {
            sent: Mutex::new(Vec::new()),
        };

        let first = svc
            .process_cycle(&settings, &snapshot(), &weather(), &transport, false)
            .await
            .unwrap();
        assert_eq!(first.dispatch.unwrap().sent, 1);

        // Same conditions next cycle: nothing sent, one duplicate recorded.
        let second = svc
            .process_cycle(&settings, &snapshot(), &weather(), &transport, false)
            .await
            .unwrap();
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.staged, 0);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        let entries = svc.delivery_log.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, DeliveryStatus::RecordedDuplicate);
    }

    #[tokio::test]
    async fn clear_queues_resets_tasks_notifications_and_staging() {
        let svc = service("clear");
        let payload = MailPayload {
            to_email: "a@x.com".into(),
            subject: "s".into(),
            content: "c".into(),
            ..Default::default()
        };
        svc.store.enqueue(&payload).unwrap();
        svc.store.create_notification(&payload, "t", "c").unwrap();
        svc.staging.save(std::slice::from_ref(&payload)).unwrap();

        let (tasks, notifications) = svc.clear_queues().unwrap();
        assert_eq!((tasks, notifications), (1, 1));
        assert!(svc.staging.load().is_empty());
    }

    #[tokio::test]
    async fn loop_lifecycle_start_stop_restart() {
        let svc = service("lifecycle");
        // No settings file exists: the loop parks in its error backoff,
        // which is exactly as stop-pollable as the normal sleep.
        svc.start().await.unwrap();
        assert!(svc.is_running().await);

        // A second start while running is a correctness error.
        assert!(svc.start().await.is_err());

        svc.stop().await.unwrap();
        assert!(!svc.is_running().await);

        // Clean restart after a stop.
        svc.start().await.unwrap();
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let svc = service("stop-noop");
        svc.stop().await.unwrap();
        assert!(!svc.is_running().await);
    }
}
