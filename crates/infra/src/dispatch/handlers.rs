use chrono::{DateTime, Utc};
use tracing::{info, warn};

use learnhub_core::{PayoutId, UserId};
use learnhub_payments::{
    Charge, CheckoutSession, ConnectedAccount, Dispute, FailureCategory, ObjectMetadata, Payout,
    PaymentIntent, PayoutStatus, ProviderPayout,
};

use crate::audit::{AuditCategory, AuditLevel, AuditRecord, AuditSink};
use crate::ledger::{AccountStatus, CoursePurchase, PaymentLedger};
use crate::store::PayoutStore;

use super::{AffectedUserType, DispatchError, HandlerResult};

type HandlerOutcome = Result<HandlerResult, DispatchError>;

fn metadata_user(metadata: &ObjectMetadata) -> Option<UserId> {
    metadata.get("userId").and_then(|raw| raw.parse().ok())
}

pub(super) fn checkout_completed(
    ledger: &dyn PaymentLedger,
    session: &CheckoutSession,
) -> HandlerOutcome {
    let Some(student_id) = metadata_user(&session.metadata) else {
        return Ok(HandlerResult::failure(format!(
            "checkout session {} has no valid userId metadata",
            session.id
        )));
    };
    let Some(course_id) = session.metadata.get("courseId") else {
        return Ok(HandlerResult::failure(format!(
            "checkout session {} has no courseId metadata",
            session.id
        )));
    };

    let purchase = CoursePurchase {
        checkout_session_id: session.id.clone(),
        payment_intent_id: session.payment_intent.clone(),
        student_id,
        course_id: course_id.clone(),
        amount_cents: session.amount_total.unwrap_or(0),
        currency: session.currency.clone().unwrap_or_else(|| "usd".to_string()),
    };
    if ledger.record_purchase(&purchase)? {
        info!(
            session = %session.id,
            student = %student_id,
            course = %course_id,
            "course purchase recorded"
        );
    }

    Ok(HandlerResult::ok()
        .affecting(Some(student_id), AffectedUserType::Student)
        .related(session.id.clone())
        .related(course_id.clone()))
}

pub(super) fn payment_succeeded(
    ledger: &dyn PaymentLedger,
    intent: &PaymentIntent,
) -> HandlerOutcome {
    ledger.record_payment_succeeded(&intent.id, intent.amount, &intent.currency)?;
    Ok(HandlerResult::ok()
        .affecting(metadata_user(&intent.metadata), AffectedUserType::Student)
        .related(intent.id.clone()))
}

pub(super) fn payment_failed(ledger: &dyn PaymentLedger, intent: &PaymentIntent) -> HandlerOutcome {
    let reason = intent
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.clone().or_else(|| e.code.clone()))
        .unwrap_or_else(|| "payment failed".to_string());
    ledger.record_payment_failed(&intent.id, &reason)?;
    Ok(HandlerResult::ok()
        .affecting(metadata_user(&intent.metadata), AffectedUserType::Student)
        .related(intent.id.clone()))
}

pub(super) fn charge_refunded(ledger: &dyn PaymentLedger, charge: &Charge) -> HandlerOutcome {
    ledger.record_refund(&charge.id, charge.amount_refunded)?;
    let mut result = HandlerResult::ok()
        .affecting(metadata_user(&charge.metadata), AffectedUserType::Student)
        .related(charge.id.clone());
    if let Some(intent) = &charge.payment_intent {
        result = result.related(intent.clone());
    }
    Ok(result)
}

pub(super) fn dispute_created(ledger: &dyn PaymentLedger, dispute: &Dispute) -> HandlerOutcome {
    if ledger.record_dispute(&dispute.id, &dispute.charge, dispute.amount)? {
        warn!(
            dispute = %dispute.id,
            charge = %dispute.charge,
            reason = dispute.reason.as_deref().unwrap_or("unspecified"),
            "charge disputed"
        );
    }
    Ok(HandlerResult::ok()
        .related(dispute.id.clone())
        .related(dispute.charge.clone()))
}

pub(super) fn account_updated(
    ledger: &dyn PaymentLedger,
    account: &ConnectedAccount,
) -> HandlerOutcome {
    let status = AccountStatus::from_capabilities(
        account.charges_enabled,
        account.payouts_enabled,
        account.details_submitted,
    );
    if ledger.update_account_status(&account.id, status)? {
        info!(account = %account.id, ?status, "connected account status changed");
    }
    Ok(HandlerResult::ok()
        .affecting(metadata_user(&account.metadata), AffectedUserType::Teacher)
        .related(account.id.clone()))
}

/// Our payout record for a provider payout: metadata `payoutId` first, then the
/// provider id.
fn find_payout(
    store: &dyn PayoutStore,
    provider: &ProviderPayout,
) -> Result<Option<Payout>, DispatchError> {
    let by_metadata = provider
        .metadata
        .get("payoutId")
        .and_then(|raw| raw.parse::<PayoutId>().ok());
    if let Some(id) = by_metadata {
        if let Some(payout) = store.get(id)? {
            return Ok(Some(payout));
        }
    }
    Ok(store.find_by_provider_id(&provider.id)?)
}

fn payout_result(payout: &Payout, provider: &ProviderPayout) -> HandlerResult {
    HandlerResult::ok()
        .affecting(Some(payout.teacher_id), AffectedUserType::Teacher)
        .related(payout.id.to_string())
        .related(provider.id.clone())
}

fn payout_not_found(provider: &ProviderPayout) -> HandlerResult {
    HandlerResult::failure(format!("no payout found for provider payout {}", provider.id))
}

pub(super) fn payout_paid(
    store: &dyn PayoutStore,
    ledger: &dyn PaymentLedger,
    provider: &ProviderPayout,
    now: DateTime<Utc>,
) -> HandlerOutcome {
    let Some(mut payout) = find_payout(store, provider)? else {
        return Ok(payout_not_found(provider));
    };

    if payout.mark_paid(now) {
        store.update(&payout)?;
        info!(payout_id = %payout.id, teacher = %payout.teacher_id, "payout marked paid");
    } else if payout.status != PayoutStatus::Paid {
        warn!(
            payout_id = %payout.id,
            status = payout.status.as_str(),
            "ignoring payout.paid for a terminal payout"
        );
        return Ok(payout_result(&payout, provider));
    }

    // Also runs when the payout was already Paid; the ledger dedups per payout.
    ledger.credit_payout(payout.id, payout.teacher_id, payout.amount_cents)?;

    Ok(payout_result(&payout, provider))
}

pub(super) fn payout_failed(
    store: &dyn PayoutStore,
    audit: &dyn AuditSink,
    provider: &ProviderPayout,
    now: DateTime<Utc>,
) -> HandlerOutcome {
    let Some(mut payout) = find_payout(store, provider)? else {
        return Ok(payout_not_found(provider));
    };

    if payout.status == PayoutStatus::Failed || payout.is_terminal() {
        return Ok(payout_result(&payout, provider));
    }

    let category = provider
        .failure_code
        .as_deref()
        .map(FailureCategory::from_failure_code);
    let reason = provider
        .failure_message
        .clone()
        .or_else(|| provider.failure_code.clone())
        .unwrap_or_else(|| "payout failed".to_string());

    let next_retry_at = (FailureCategory::should_retry(category) && payout.has_retry_budget())
        .then(|| {
            payout
                .retry_config
                .next_retry_at(payout.retry_count, now, &mut rand::rng())
        });

    payout.fail(category, reason, next_retry_at, now);
    store.update(&payout)?;
    warn!(
        payout_id = %payout.id,
        category = category.map(FailureCategory::as_str).unwrap_or("none"),
        retry_scheduled = next_retry_at.is_some(),
        "payout failed at provider"
    );

    if payout.is_terminal() {
        let record = AuditRecord::new(
            AuditCategory::Payout,
            AuditLevel::Critical,
            "Payout permanently failed",
            now,
        )
        .with("payoutId", payout.id)
        .with("teacherId", payout.teacher_id)
        .with("attemptCount", payout.retry_count)
        .with("failureCategory", payout.failure_category)
        .with("reason", &payout.failure_reason)
        .with("providerPayoutId", &provider.id);
        if let Err(err) = audit.record(record) {
            warn!(error = %err, "failed to write payout audit record");
        }
    }

    Ok(payout_result(&payout, provider))
}

pub(super) fn payout_canceled(
    store: &dyn PayoutStore,
    provider: &ProviderPayout,
    now: DateTime<Utc>,
) -> HandlerOutcome {
    let Some(mut payout) = find_payout(store, provider)? else {
        return Ok(payout_not_found(provider));
    };

    if payout.mark_canceled(now) {
        store.update(&payout)?;
        info!(payout_id = %payout.id, "payout canceled");
    }
    Ok(payout_result(&payout, provider))
}
