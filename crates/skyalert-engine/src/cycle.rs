//! One evaluation cycle: forecasts → rule matches → candidates → dedup →
//! approval gate → (auto mode) dispatch.
//!
//! Per-item failures are isolated throughout: a malformed rule condition
//! or missing template skips that item with a log line and the batch keeps
//! going.

use std::collections::HashMap;

use chrono::{Local, NaiveDate};
use skyalert_core::config::{Settings, Snapshot};
use skyalert_core::error::Result;
use skyalert_core::types::{Candidate, DeliveryStatus, MailPayload, RegionForecast, Template};
use skyalert_mailer::template::{build_payload, select_template};
use skyalert_mailer::transport::{MailTransport, send_with_retry};
use skyalert_rules::condition::Condition;
use skyalert_rules::evaluator::evaluate;
use skyalert_store::{DeliveryLog, MailStore, PendingStage};

use crate::dedup::is_duplicate_within_week;
use crate::dispatcher::{DispatchReport, process_queue};

/// What one cycle produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    /// Candidates derived from rule evaluation (pre-dedup).
    pub candidates: usize,
    /// Payloads that passed dedup and entered the gate.
    pub staged: usize,
    /// Candidates recorded as duplicates instead of queued.
    pub duplicates: usize,
    /// Present in auto-approval mode only.
    pub dispatch: Option<DispatchReport>,
}

/// Evaluate every active rule against every region and fan matches out to
/// the subscribed recipients. The gate mode and advance settings come from
/// the per-cycle snapshot, evaluated once here, not per candidate.
pub fn evaluate_candidates(
    weather: &HashMap<String, RegionForecast>,
    snapshot: &Snapshot,
    settings: &Settings,
    today: NaiveDate,
) -> Vec<Candidate> {
    let interval_prediction = settings.interval_prediction();
    let global_advance = settings.advance_days();
    let mut candidates = Vec::new();

    let mut regions: Vec<&String> = weather.keys().collect();
    regions.sort();

    for region in regions {
        let forecast = &weather[region];
        for rule in &snapshot.rules {
            if !rule.is_active() {
                continue;
            }
            let condition = match Condition::parse(&rule.condition, rule.kind) {
                Ok(c) => c,
                Err(e) => {
                    // Data error: skip the rule, keep evaluating the rest.
                    tracing::warn!("⚠️ Skipping rule {} ({}): {e}", rule.id, rule.weather_type);
                    continue;
                }
            };
            let advance_days = rule.advance_days.unwrap_or(global_advance);
            let Some(matched) = evaluate(
                &forecast.forecasts,
                &condition,
                today,
                advance_days,
                interval_prediction,
            ) else {
                continue;
            };

            tracing::info!(
                "🔔 Rule matched: {} {} in {region} on {} (day +{})",
                rule.weather_type,
                rule.condition,
                matched.date,
                matched.day_offset
            );

            for customer in &snapshot.customers {
                if customer.region != *region
                    || !customer.weather_types.contains(&rule.weather_type)
                {
                    continue;
                }
                candidates.push(Candidate {
                    customer: customer.clone(),
                    region: region.clone(),
                    weather_type: rule.weather_type.clone(),
                    condition: rule.condition.clone(),
                    forecast_date: matched.date,
                });
            }
        }
    }

    candidates
}

/// Render, deduplicate and route a cycle's candidates. In auto-approval
/// mode the queue is drained inline; in manual mode pending notifications
/// are created and an optional admin summary goes out.
#[allow(clippy::too_many_arguments)]
pub async fn process_candidates(
    store: &MailStore,
    delivery_log: &DeliveryLog,
    staging: &PendingStage,
    transport: &dyn MailTransport,
    settings: &Settings,
    templates: &[Template],
    candidates: Vec<Candidate>,
    is_test: bool,
) -> Result<CycleReport> {
    let mut report = CycleReport {
        candidates: candidates.len(),
        ..Default::default()
    };
    if candidates.is_empty() {
        tracing::info!("No alert conditions detected this cycle");
        return Ok(report);
    }

    // Render. Missing templates skip the candidate, never the batch.
    let mut payloads: Vec<MailPayload> = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let Some(template) = select_template(
            templates,
            &candidate.weather_type,
            candidate.customer.is_engineer(),
        ) else {
            tracing::warn!(
                "⚠️ No template for {} ({}), skipping {}",
                candidate.weather_type,
                candidate.customer.category,
                candidate.customer.name
            );
            continue;
        };
        payloads.push(build_payload(candidate, template, is_test));
    }

    // Dedup before anything is queued. Duplicates are recorded so future
    // checks keep seeing them, and counted for the caller.
    let mut fresh: Vec<MailPayload> = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let entries = delivery_log.load();
        if is_duplicate_within_week(&entries, &payload, Local::now().naive_local()) {
            delivery_log.record(&payload, DeliveryStatus::RecordedDuplicate, is_test)?;
            report.duplicates += 1;
            tracing::info!(
                "⚠️ Duplicate within 7 days, recorded without queueing: {} ({})",
                payload.to_name,
                payload.to_email
            );
        } else {
            fresh.push(payload);
        }
    }
    report.staged = fresh.len();

    // Legacy mirror of the batch; queue-driven dispatch clears it again.
    staging.save(&fresh)?;

    if settings.auto_approval {
        tracing::info!("Auto-approval enabled: queueing {} payload(s)", fresh.len());
        for payload in &fresh {
            store.enqueue(payload)?;
        }
        report.dispatch = Some(process_queue(store, delivery_log, staging, transport, is_test).await?);
    } else {
        for payload in &fresh {
            let title = format!("天气预警: {} - {}", payload.weather_type, payload.region);
            let content = format!(
                "检测到{}地区可能出现{}天气情况，是否发送预警邮件？",
                payload.region, payload.weather_type
            );
            let nid = store.create_notification(payload, &title, &content)?;
            tracing::info!("📋 Created notification {nid} for {}", payload.to_email);
        }
        if settings.admin_notifications && !fresh.is_empty() {
            if let Err(e) = send_admin_summary(transport, settings, &fresh).await {
                tracing::warn!("⚠️ Admin summary email failed: {e}");
            }
        }
    }

    Ok(report)
}

/// Summary email to the configured sender address listing what awaits
/// review. Best-effort; failure never affects the staged notifications.
async fn send_admin_summary(
    transport: &dyn MailTransport,
    settings: &Settings,
    payloads: &[MailPayload],
) -> Result<()> {
    let subject = format!("【系统通知】检测到{}个预警情况", payloads.len());
    let mut body = String::from("预警系统检测到以下待审核预警：\n");
    for p in payloads {
        body.push_str(&format!(
            "- 地区: {} | 类型: {} | 接收人: {} ({})\n",
            p.region, p.weather_type, p.to_name, p.to_email
        ));
    }
    body.push_str("\n请登录系统查看详情并进行处理。");
    send_with_retry(transport, &settings.email_sender, &subject, &body, &[]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skyalert_core::error::SkyAlertError;
    use skyalert_core::types::{AlertRule, Customer, ForecastPoint};
    use std::sync::Mutex;

    struct MockTransport {
        sent: Mutex<Vec<(String, String)>>,
        fail_all: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_all: false,
            }
        }
    }

    #[async_trait]
    impl MailTransport for MockTransport {
        async fn send(&self, to: &str, subject: &str, _b: &str, _a: &[String]) -> Result<()> {
            if self.fail_all {
                return Err(SkyAlertError::Mail("refused".into()));
            }
            self.sent.lock().unwrap().push((to.into(), subject.into()));
            Ok(())
        }
    }

    struct Fixture {
        store: MailStore,
        log: DeliveryLog,
        staging: PendingStage,
    }

    fn fixture(name: &str) -> Fixture {
        let dir = std::env::temp_dir().join("skyalert-cycle-test").join(name);
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        Fixture {
            store: MailStore::open(&dir.join("queue.db")).unwrap(),
            log: DeliveryLog::new(dir.join("delivery_log.json"), dir.join("backups")),
            staging: PendingStage::new(dir.join("pending_emails.json"), dir.join("backups")),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 7).unwrap()
    }

    fn weather(region: &str, temps: &[f64]) -> HashMap<String, RegionForecast> {
        let forecasts = temps
            .iter()
            .enumerate()
            .map(|(i, t)| ForecastPoint {
                date: today() + chrono::Days::new(i as u64),
                temp_max: Some(*t),
                ..Default::default()
            })
            .collect();
        HashMap::from([(
            region.to_string(),
            RegionForecast {
                region: region.to_string(),
                update_time: String::new(),
                forecasts,
            },
        )])
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
                content: "{{name}}，{{region}}将出现高温。".into(),
                ..Default::default()
            }],
        }
    }

    fn settings(json: &str) -> Settings {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn matching_rule_produces_one_candidate_per_subscriber() {
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snapshot(),
            &settings("{}"),
            today(),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].customer.email, "zhang@x.com");
        assert_eq!(candidates[0].forecast_date, today() + chrono::Days::new(1));
    }

    #[test]
    fn unsubscribed_or_other_region_customers_are_skipped() {
        let mut snap = snapshot();
        snap.customers[0].weather_types = vec!["暴雨".into()];
        assert!(
            evaluate_candidates(&weather("北京", &[30.0, 36.0]), &snap, &settings("{}"), today())
                .is_empty()
        );

        let mut snap = snapshot();
        snap.customers[0].region = "上海".into();
        assert!(
            evaluate_candidates(&weather("北京", &[30.0, 36.0]), &snap, &settings("{}"), today())
                .is_empty()
        );
    }

    #[test]
    fn inactive_and_malformed_rules_are_isolated() {
        let mut snap = snapshot();
        snap.rules[0].status = "停用".into();
        assert!(
            evaluate_candidates(&weather("北京", &[36.0, 36.0]), &snap, &settings("{}"), today())
                .is_empty()
        );

        let mut snap = snapshot();
        snap.rules.insert(
            0,
            AlertRule {
                id: 9,
                weather_type: "高温".into(),
                condition: "气压 !! nonsense".into(),
                status: "活跃".into(),
                ..Default::default()
            },
        );
        // The bad rule is skipped; the good one still matches.
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snap,
            &settings("{}"),
            today(),
        );
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn interval_mode_uses_nearest_matching_day() {
        let mut snap = snapshot();
        snap.rules[0].advance_days = Some(3);
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0, 30.0, 38.0]),
            &snap,
            &settings(r#"{"intervalPrediction": true}"#),
            today(),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].forecast_date, today() + chrono::Days::new(1));
    }

    #[tokio::test]
    async fn auto_mode_creates_one_task_and_one_sent_entry() {
        let f = fixture("auto");
        let transport = MockTransport::new();
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snapshot(),
            &settings(r#"{"autoApproval": true}"#),
            today(),
        );
        assert_eq!(candidates.len(), 1);

        let report = process_candidates(
            &f.store,
            &f.log,
            &f.staging,
            &transport,
            &settings(r#"{"autoApproval": true}"#),
            &snapshot().templates,
            candidates,
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.staged, 1);
        assert_eq!(report.dispatch.unwrap().sent, 1);

        let entries = f.log.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, DeliveryStatus::Sent);
        assert_eq!(entries[0].recipient, "zhang@x.com");
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        // Exactly one task, now terminal.
        assert_eq!(f.store.pending_task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_mode_stages_notifications_without_sending() {
        let f = fixture("manual");
        let transport = MockTransport::new();
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snapshot(),
            &settings("{}"),
            today(),
        );

        let report = process_candidates(
            &f.store,
            &f.log,
            &f.staging,
            &transport,
            &settings("{}"),
            &snapshot().templates,
            candidates,
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.staged, 1);
        assert!(report.dispatch.is_none());
        assert_eq!(f.store.pending_notifications().unwrap().len(), 1);
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(f.log.load().is_empty());
        // Legacy mirror holds the staged batch until it is resolved.
        assert_eq!(f.staging.load().len(), 1);
    }

    #[tokio::test]
    async fn staging_time_duplicates_are_recorded_not_queued() {
        let f = fixture("dup");
        let transport = MockTransport::new();
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snapshot(),
            &settings(r#"{"autoApproval": true}"#),
            today(),
        );
        // Same fingerprint already sent yesterday.
        let mut prior = MailPayload {
            to_email: "zhang@x.com".into(),
            region: "北京".into(),
            weather_type: "高温".into(),
            condition: "温度 >= 35".into(),
            category: "客户".into(),
            subject: "s".into(),
            content: "c".into(),
            ..Default::default()
        };
        prior.to_name = "张三".into();
        f.log.record(&prior, DeliveryStatus::Sent, false).unwrap();

        let report = process_candidates(
            &f.store,
            &f.log,
            &f.staging,
            &transport,
            &settings(r#"{"autoApproval": true}"#),
            &snapshot().templates,
            candidates,
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.staged, 0);
        assert!(transport.sent.lock().unwrap().is_empty());
        let entries = f.log.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, DeliveryStatus::RecordedDuplicate);
    }

    #[tokio::test]
    async fn missing_template_skips_candidate() {
        let f = fixture("no-template");
        let transport = MockTransport::new();
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snapshot(),
            &settings(r#"{"autoApproval": true}"#),
            today(),
        );

        let report = process_candidates(
            &f.store,
            &f.log,
            &f.staging,
            &transport,
            &settings(r#"{"autoApproval": true}"#),
            &[], // no templates at all
            candidates,
            false,
        )
        .await
        .unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.staged, 0);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_summary_goes_out_in_manual_mode() {
        let f = fixture("admin");
        let transport = MockTransport::new();
        let candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snapshot(),
            &settings("{}"),
            today(),
        );

        process_candidates(
            &f.store,
            &f.log,
            &f.staging,
            &transport,
            &settings(r#"{"adminNotifications": true, "emailSender": "admin@x.com"}"#),
            &snapshot().templates,
            candidates,
            false,
        )
        .await
        .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "admin@x.com");
        assert!(sent[0].1.contains("检测到1个预警情况"));
    }

    #[tokio::test]
    async fn manual_twins_resolve_to_one_send_and_no_dedup_entries() {
        // Two identical candidates in one batch become two distinct
        // notifications (not a dedup case); rejecting one and approving
        // the other yields exactly one sent entry.
        let f = fixture("twins");
        let transport = MockTransport::new();
        let mut candidates = evaluate_candidates(
            &weather("北京", &[30.0, 36.0]),
            &snapshot(),
            &settings("{}"),
            today(),
        );
        candidates.push(candidates[0].clone());

        process_candidates(
            &f.store,
            &f.log,
            &f.staging,
            &transport,
            &settings("{}"),
            &snapshot().templates,
            candidates,
            false,
        )
        .await
        .unwrap();

        let pending = f.store.pending_notifications().unwrap();
        assert_eq!(pending.len(), 2);

        crate::approval::reject(&f.store, &f.staging, &pending[0].notification_id)
            .await
            .unwrap();
        crate::approval::approve(
            &f.store,
            &f.log,
            &f.staging,
            &transport,
            &pending[1].notification_id,
        )
        .await
        .unwrap();

        let entries = f.log.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, DeliveryStatus::Sent);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }
}
