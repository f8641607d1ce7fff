//! Manual-approval gate operations.
//!
//! In manual mode, non-duplicate candidates become pending notifications
//! for a human reviewer. Approval sends immediately through the transport
//! (not via the queue) and records the outcome; rejection resolves the
//! notification without sending. Both remove the matching staged record.
//! A notification resolves exactly once — re-resolving is an explicit
//! error surfaced by the store.

use skyalert_core::error::{Result, SkyAlertError};
use skyalert_core::types::{DeliveryStatus, MailPayload, NotificationStatus};
use skyalert_mailer::template::{default_body, default_subject};
use skyalert_mailer::transport::{MailTransport, send_with_retry};
use skyalert_store::{DeliveryLog, MailStore, PendingStage};

/// Approve: send the notification's payload now, then mark it approved,
/// append a sent log entry and drop the staged copy.
///
/// The status only transitions after a successful send, so a transport
/// failure leaves the notification pending for another attempt.
pub async fn approve(
    store: &MailStore,
    delivery_log: &DeliveryLog,
    staging: &PendingStage,
    transport: &dyn MailTransport,
    notification_id: &str,
) -> Result<()> {
    let notification = store
        .get_notification(notification_id)?
        .ok_or_else(|| SkyAlertError::NotificationResolved(notification_id.to_string()))?;
    if notification.status != NotificationStatus::Pending {
        return Err(SkyAlertError::NotificationResolved(
            notification_id.to_string(),
        ));
    }

    let mut payload: MailPayload = serde_json::from_str(&notification.payload)?;
    fill_payload_defaults(&mut payload);
    if payload.to_email.is_empty() {
        return Err(SkyAlertError::Mail(
            "notification payload has no recipient".into(),
        ));
    }

    send_with_retry(
        transport,
        &payload.to_email,
        &payload.subject,
        &payload.content,
        &payload.attachments,
    )
    .await?;

    store.resolve_notification(notification_id, NotificationStatus::Approved)?;
    delivery_log.record(&payload, DeliveryStatus::Sent, notification.is_test)?;
    staging.remove_matching(&payload)?;
    tracing::info!("✓ Notification {notification_id} approved and sent to {}", payload.to_email);
    Ok(())
}

/// Reject: resolve without sending and drop the staged copy.
pub async fn reject(
    store: &MailStore,
    staging: &PendingStage,
    notification_id: &str,
) -> Result<()> {
    let notification = store.resolve_notification(notification_id, NotificationStatus::Rejected)?;
    if let Ok(payload) = serde_json::from_str::<MailPayload>(&notification.payload) {
        staging.remove_matching(&payload)?;
    }
    tracing::info!("✗ Notification {notification_id} rejected");
    Ok(())
}

/// Historic notifications can carry empty subject/content; patch them with
/// the generated defaults rather than failing the approval.
fn fill_payload_defaults(payload: &mut MailPayload) {
    if payload.content.trim().is_empty() {
        payload.content = default_body(
            &payload.to_name,
            &payload.region,
            &payload.alert_date,
            &payload.weather_type,
            &payload.condition,
        );
    }
    if payload.subject.trim().is_empty() {
        payload.subject = default_subject(&payload.region, &payload.weather_type);
    }
}
