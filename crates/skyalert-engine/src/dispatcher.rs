//! Queue drain: claim, re-check duplication, send, record.
//!
//! The durable queue is the primary source; the legacy staging file is
//! consulted only when the queue yields nothing. Every claimed task is
//! re-checked against the delivery log before sending — a task can go
//! stale between enqueue and dispatch.

use chrono::Local;
use skyalert_core::error::Result;
use skyalert_core::types::{DeliveryStatus, MailPayload};
use skyalert_mailer::transport::{MailTransport, send_with_retry};
use skyalert_store::{DeliveryLog, MailStore, PendingStage};

use crate::dedup::is_duplicate_within_week;

/// Outcome counts for one dispatch batch. Nothing is dropped silently:
/// every claimed item lands in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    pub duplicates: usize,
}

/// Drain pending work and deliver it. `is_test` filters queue claims; the
/// legacy fallback applies the same filter on the payload flag.
pub async fn process_queue(
    store: &MailStore,
    delivery_log: &DeliveryLog,
    staging: &PendingStage,
    transport: &dyn MailTransport,
    is_test: bool,
) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();

    let tasks = store.claim(Some(is_test), None)?;
    let from_queue = !tasks.is_empty();

    if from_queue {
        for task in &tasks {
            let payload: MailPayload = match serde_json::from_str(&task.payload) {
                Ok(p) => p,
                Err(e) => {
                    // Data error: isolate this task, keep the batch going.
                    store.fail(&task.task_id, &format!("payload parse: {e}"))?;
                    report.failed += 1;
                    continue;
                }
            };
            handle_payload(
                store,
                delivery_log,
                transport,
                &payload,
                Some(&task.task_id),
                is_test,
                &mut report,
            )
            .await?;
        }
    } else {
        let legacy: Vec<MailPayload> = staging
            .load()
            .into_iter()
            .filter(|p| p.is_test == is_test)
            .collect();
        if !legacy.is_empty() {
            tracing::info!("📂 Queue empty, falling back to {} staged payload(s)", legacy.len());
        }
        for payload in &legacy {
            handle_payload(store, delivery_log, transport, payload, None, is_test, &mut report)
                .await?;
        }
    }

    // Queue-driven batches also exist in the staging file for
    // compatibility; clear it so the next cycle cannot replay them.
    if from_queue {
        staging.clear()?;
    }

    tracing::info!(
        "📮 Dispatch complete: {} sent, {} failed, {} duplicate(s)",
        report.sent,
        report.failed,
        report.duplicates
    );
    Ok(report)
}

async fn handle_payload(
    store: &MailStore,
    delivery_log: &DeliveryLog,
    transport: &dyn MailTransport,
    payload: &MailPayload,
    task_id: Option<&str>,
    is_test: bool,
    report: &mut DispatchReport,
) -> Result<()> {
    // Reload per item so a send earlier in this batch is visible here;
    // in-batch duplicates must not slip through.
    let log_entries = delivery_log.load();
    if is_duplicate_within_week(&log_entries, payload, Local::now().naive_local()) {
        delivery_log.record(payload, DeliveryStatus::RecordedDuplicate, is_test)?;
        if let Some(id) = task_id {
            store.fail(id, "duplicate")?;
        }
        report.duplicates += 1;
        tracing::info!(
            "⚠️ Duplicate within 7 days, recorded without sending: {} ({})",
            payload.to_name,
            payload.to_email
        );
        return Ok(());
    }

    match send_with_retry(
        transport,
        &payload.to_email,
        &payload.subject,
        &payload.content,
        &payload.attachments,
    )
    .await
    {
        Ok(()) => {
            delivery_log.record(payload, DeliveryStatus::Sent, is_test)?;
            if let Some(id) = task_id {
                store.complete(id)?;
            }
            report.sent += 1;
            tracing::info!("✓ Sent to {} ({})", payload.to_name, payload.to_email);
        }
        Err(e) => {
            if let Some(id) = task_id {
                store.fail(id, &e.to_string())?;
            }
            report.failed += 1;
            tracing::warn!("✗ Send failed for {}: {e}", payload.to_email);
        }
    }
    Ok(())
}
