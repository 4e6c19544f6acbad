use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use tracing::{error, info, warn};

use shopfront_core::event::{self, WebhookEvent};
use shopfront_core::signature;
use shopfront_core::transition::{next_status, Transition};
use shopfront_core::types::{EventType, OrderStatus, PaymentStatus};
use shopfront_storage::{NewPayment, OrderError, PaymentError, ProcessedEventError};

use crate::error::ApiError;
use crate::router::AppState;

const HEADER_SIGNATURE: &str = "x-signature";

/// Bounded retries when a concurrent writer moves the order between the
/// read and the conditional update.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

const OUTCOME_APPLIED: &str = "applied";
const OUTCOME_NOOP: &str = "noop";
const OUTCOME_INVALID_TRANSITION: &str = "invalid_transition";
const OUTCOME_ORDER_NOT_FOUND: &str = "order_not_found";
const OUTCOME_MISSING_ORDER_REFERENCE: &str = "missing_order_reference";
const OUTCOME_RECORDED: &str = "recorded";

/// Acknowledgement body for accepted deliveries.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    success: bool,
    processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<bool>,
}

impl WebhookAck {
    fn processed() -> Self {
        Self {
            success: true,
            processed: true,
            duplicate: None,
        }
    }

    fn duplicate() -> Self {
        Self {
            success: true,
            processed: true,
            duplicate: Some(true),
        }
    }
}

pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let start = Instant::now();
    let response = match process(&state, &headers, &body).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(err) => err.into_response(),
    };
    histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
    response
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<WebhookAck, ApiError> {
    // Signature before parsing: unauthenticated input gets no further work.
    let signature_header = headers
        .get(HEADER_SIGNATURE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            counter!("webhook_invalid_signature_total").increment(1);
            ApiError::new(StatusCode::FORBIDDEN, "missing signature header")
        })?;

    let secret = state.webhook_secret();
    if !signature::verify(body, signature_header, &secret) {
        counter!("webhook_invalid_signature_total").increment(1);
        warn!(stage = "ingress", "webhook rejected: invalid signature");
        return Err(ApiError::new(StatusCode::FORBIDDEN, "invalid signature"));
    }

    let event = event::parse(body, state.now())
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;

    counter!("webhook_ingress_total", "type" => event.event_type.as_str()).increment(1);

    match event.event_type {
        EventType::Payment => process_payment(state, &event).await,
        EventType::Order => process_order(state, &event).await,
    }
}

/// Payment details after inline extraction or a provider lookup.
struct ResolvedPayment {
    status: PaymentStatus,
    order_id: Option<i64>,
    amount_cents: Option<i64>,
    currency: Option<String>,
}

/// Resolves the payment behind a notification. Runs before any claim is
/// taken, so a failed provider lookup surfaces a 5xx with nothing persisted
/// and the redelivery can succeed.
async fn resolve_payment(
    state: &AppState,
    event: &WebhookEvent,
) -> Result<ResolvedPayment, ApiError> {
    if let Some(inline) = &event.payment {
        if let Some(status) = inline.status {
            return Ok(ResolvedPayment {
                status,
                order_id: parse_order_reference(inline.external_reference.as_deref()),
                amount_cents: inline.transaction_amount.map(to_cents),
                currency: inline.currency_id.clone(),
            });
        }
    }

    // The notification carried only the payment id; ask the provider.
    let resource = state
        .mercadopago()
        .fetch_payment(&event.external_id)
        .await
        .map_err(|err| {
            error!(
                stage = "resolve",
                external_id = %event.external_id,
                error = %err,
                "failed to fetch payment from provider"
            );
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to resolve payment details",
            )
        })?;

    let status = match resource.status.parse::<PaymentStatus>() {
        Ok(status) => status,
        Err(err) => {
            // An unrecognized settlement state cannot move the order; treat
            // it as pending so the payment row is still recorded.
            warn!(
                stage = "resolve",
                external_id = %event.external_id,
                error = %err,
                "provider returned unrecognized payment status"
            );
            PaymentStatus::Pending
        }
    };

    Ok(ResolvedPayment {
        status,
        order_id: parse_order_reference(resource.external_reference.as_deref()),
        amount_cents: resource.transaction_amount.map(to_cents),
        currency: resource.currency_id,
    })
}

fn parse_order_reference(reference: Option<&str>) -> Option<i64> {
    reference.and_then(|value| value.trim().parse::<i64>().ok())
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

async fn process_payment(state: &AppState, event: &WebhookEvent) -> Result<WebhookAck, ApiError> {
    let payment = resolve_payment(state, event).await?;

    let mut tx = state.storage().begin().await.map_err(storage_unavailable)?;
    let claim = state
        .storage()
        .processed_events()
        .claim(&mut tx, &event.external_id, event.event_type, event.received_at)
        .await
        .map_err(processed_event_error)?;

    if claim.is_duplicate() {
        counter!("webhook_duplicate_total", "type" => "payment").increment(1);
        info!(
            stage = "ingress",
            external_id = %event.external_id,
            "duplicate payment delivery acknowledged"
        );
        return Ok(WebhookAck::duplicate());
    }

    let outcome = apply_payment(state, &mut tx, event, &payment).await?;
    state
        .storage()
        .processed_events()
        .finalize(&mut tx, &event.external_id, event.event_type, outcome)
        .await
        .map_err(processed_event_error)?;
    tx.commit().await.map_err(storage_unavailable)?;

    Ok(WebhookAck::processed())
}

async fn apply_payment(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    event: &WebhookEvent,
    payment: &ResolvedPayment,
) -> Result<&'static str, ApiError> {
    let Some(order_id) = payment.order_id else {
        warn!(
            stage = "transition",
            external_id = %event.external_id,
            "payment event carries no usable order reference"
        );
        return Ok(OUTCOME_MISSING_ORDER_REFERENCE);
    };

    let orders = state.storage().orders();
    for _attempt in 0..MAX_TRANSITION_ATTEMPTS {
        let order = match orders.fetch(tx, order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(
                    stage = "transition",
                    order_id,
                    external_id = %event.external_id,
                    "order referenced by payment does not exist"
                );
                return Ok(OUTCOME_ORDER_NOT_FOUND);
            }
            Err(OrderError::InvalidStatus(value)) => {
                error!(
                    stage = "transition",
                    order_id,
                    status = %value,
                    "order row carries unknown status; skipping transition"
                );
                return Ok(OUTCOME_INVALID_TRANSITION);
            }
            Err(OrderError::Database(err)) => return Err(storage_unavailable(err)),
        };

        let transition = next_status(order.status, payment.status);
        counter!("order_transitions_total", "result" => transition.metric_result()).increment(1);

        match transition {
            Transition::Noop => {
                upsert_payment_row(state, tx, event, payment, order_id).await?;
                return Ok(OUTCOME_NOOP);
            }
            Transition::Rejected => {
                warn!(
                    stage = "transition",
                    order_id,
                    from = order.status.as_str(),
                    payment_status = payment.status.as_str(),
                    external_id = %event.external_id,
                    "invalid transition; acknowledging without mutation"
                );
                return Ok(OUTCOME_INVALID_TRANSITION);
            }
            Transition::Apply(next) => {
                let payment_reference =
                    (next == OrderStatus::Paid).then_some(event.external_id.as_str());
                let updated = orders
                    .update_status(tx, order_id, order.status, next, payment_reference, state.now())
                    .await
                    .map_err(order_error)?;
                if updated {
                    info!(
                        stage = "transition",
                        order_id,
                        from = order.status.as_str(),
                        to = next.as_str(),
                        external_id = %event.external_id,
                        "order transition applied"
                    );
                    upsert_payment_row(state, tx, event, payment, order_id).await?;
                    return Ok(OUTCOME_APPLIED);
                }
                // Another writer moved the order; re-read and re-evaluate.
            }
        }
    }

    error!(
        stage = "transition",
        order_id,
        external_id = %event.external_id,
        "order kept changing underneath the conditional update"
    );
    Err(ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "storage contention while applying transition",
    ))
}

async fn upsert_payment_row(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    event: &WebhookEvent,
    payment: &ResolvedPayment,
    order_id: i64,
) -> Result<(), ApiError> {
    state
        .storage()
        .payments()
        .upsert(
            tx,
            &NewPayment {
                payment_id: &event.external_id,
                order_id,
                status: payment.status,
                amount_cents: payment.amount_cents,
                currency: payment.currency.as_deref(),
                recorded_at: state.now(),
            },
        )
        .await
        .map_err(payment_error)
}

/// Merchant-order notifications carry no state transition of their own;
/// they are recorded in the ledger for audit and acknowledged.
async fn process_order(state: &AppState, event: &WebhookEvent) -> Result<WebhookAck, ApiError> {
    let mut tx = state.storage().begin().await.map_err(storage_unavailable)?;
    let claim = state
        .storage()
        .processed_events()
        .claim(&mut tx, &event.external_id, event.event_type, event.received_at)
        .await
        .map_err(processed_event_error)?;

    if claim.is_duplicate() {
        counter!("webhook_duplicate_total", "type" => "order").increment(1);
        info!(
            stage = "ingress",
            external_id = %event.external_id,
            "duplicate order delivery acknowledged"
        );
        return Ok(WebhookAck::duplicate());
    }

    state
        .storage()
        .processed_events()
        .finalize(&mut tx, &event.external_id, event.event_type, OUTCOME_RECORDED)
        .await
        .map_err(processed_event_error)?;
    tx.commit().await.map_err(storage_unavailable)?;

    info!(
        stage = "ingress",
        external_id = %event.external_id,
        "order notification recorded"
    );
    Ok(WebhookAck::processed())
}

fn storage_unavailable(err: sqlx::Error) -> ApiError {
    error!(stage = "storage", error = %err, "storage unavailable");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
}

fn processed_event_error(err: ProcessedEventError) -> ApiError {
    let ProcessedEventError::Database(err) = err;
    storage_unavailable(err)
}

fn order_error(err: OrderError) -> ApiError {
    match err {
        OrderError::Database(err) => storage_unavailable(err),
        OrderError::InvalidStatus(value) => {
            error!(stage = "storage", status = %value, "order row carries unknown status");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}

fn payment_error(err: PaymentError) -> ApiError {
    match err {
        PaymentError::Database(err) => storage_unavailable(err),
        PaymentError::InvalidStatus(value) => {
            error!(stage = "storage", status = %value, "payment row carries unknown status");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}
