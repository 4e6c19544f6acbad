use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{EventType, PaymentStatus};

/// A webhook notification decoded from the raw request body.
///
/// Only the effects of an event are persisted; the event itself lives for
/// the duration of one HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub event_type: EventType,
    /// Provider-assigned identifier extracted from `data.id`.
    pub external_id: String,
    pub received_at: DateTime<Utc>,
    /// Timestamp claimed by the provider, when present in the payload.
    pub sent_at: Option<DateTime<Utc>>,
    /// Payment details inlined into `data`, when the provider sent more
    /// than the bare id.
    pub payment: Option<InlinePayment>,
}

/// Payment fields the provider sometimes inlines into the notification.
///
/// When `status` is absent (or not a status this service understands) the
/// caller must resolve the payment through the provider API instead.
#[derive(Debug, Clone, PartialEq)]
pub struct InlinePayment {
    pub status: Option<PaymentStatus>,
    pub external_reference: Option<String>,
    pub transaction_amount: Option<f64>,
    pub currency_id: Option<String>,
}

impl InlinePayment {
    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.external_reference.is_none()
            && self.transaction_amount.is_none()
            && self.currency_id.is_none()
    }
}

/// Errors raised while decoding a webhook payload.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed json payload: {0}")]
    MalformedJson(#[source] serde_json::Error),
    #[error("unrecognized event type: {found}")]
    UnknownType { found: String },
    #[error("payload is missing data.id")]
    MissingId,
}

#[derive(Deserialize)]
struct RawNotification {
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<RawData>,
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct RawData {
    id: Option<Value>,
    status: Option<String>,
    external_reference: Option<String>,
    transaction_amount: Option<f64>,
    currency_id: Option<String>,
}

/// Decodes the raw request body into a typed [`WebhookEvent`].
///
/// Performs no network or storage side effects. The body must already have
/// passed signature verification; parsing failures map to client errors,
/// never to retries.
pub fn parse(raw_body: &[u8], received_at: DateTime<Utc>) -> Result<WebhookEvent, ParseError> {
    let raw: RawNotification =
        serde_json::from_slice(raw_body).map_err(ParseError::MalformedJson)?;

    let kind = raw.kind.unwrap_or_default();
    let event_type = kind
        .parse::<EventType>()
        .map_err(|_| ParseError::UnknownType { found: kind })?;

    let data = raw.data.ok_or(ParseError::MissingId)?;
    let external_id = match data.id {
        Some(Value::String(id)) if !id.is_empty() => id,
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(ParseError::MissingId),
    };

    let payment = InlinePayment {
        // An unknown inline status falls back to a provider lookup rather
        // than failing the request.
        status: data.status.and_then(|value| value.parse::<PaymentStatus>().ok()),
        external_reference: data.external_reference,
        transaction_amount: data.transaction_amount,
        currency_id: data.currency_id,
    };

    Ok(WebhookEvent {
        event_type,
        external_id,
        received_at,
        sent_at: raw
            .timestamp
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc)),
        payment: (!payment.is_empty()).then_some(payment),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    #[test]
    fn parses_minimal_payment_notification() {
        let body = br#"{"type":"payment","data":{"id":"mp-1"}}"#;
        let event = parse(body, now()).expect("parse");
        assert_eq!(event.event_type, EventType::Payment);
        assert_eq!(event.external_id, "mp-1");
        assert_eq!(event.payment, None);
        assert_eq!(event.sent_at, None);
    }

    #[test]
    fn parses_inline_payment_details() {
        let body = br#"{
            "type": "payment",
            "data": {
                "id": "mp-2",
                "status": "approved",
                "external_reference": "42",
                "transaction_amount": 150.5,
                "currency_id": "ARS"
            },
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        let event = parse(body, now()).expect("parse");
        let payment = event.payment.expect("inline payment");
        assert_eq!(payment.status, Some(PaymentStatus::Approved));
        assert_eq!(payment.external_reference.as_deref(), Some("42"));
        assert_eq!(payment.transaction_amount, Some(150.5));
        assert_eq!(payment.currency_id.as_deref(), Some("ARS"));
        assert_eq!(event.sent_at, Some(now()));
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let body = br#"{"type":"payment","data":{"id":123456789}}"#;
        let event = parse(body, now()).expect("parse");
        assert_eq!(event.external_id, "123456789");
    }

    #[test]
    fn unknown_inline_status_falls_back_to_lookup() {
        let body = br#"{"type":"payment","data":{"id":"mp-3","status":"settled"}}"#;
        let event = parse(body, now()).expect("parse");
        assert_eq!(event.payment, None);
    }

    #[test]
    fn empty_body_is_malformed() {
        assert!(matches!(
            parse(b"", now()),
            Err(ParseError::MalformedJson(_))
        ));
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            parse(b"{not json", now()),
            Err(ParseError::MalformedJson(_))
        ));
    }

    #[test]
    fn unrecognized_type_is_reported_with_value() {
        let body = br#"{"type":"subscription","data":{"id":"mp-4"}}"#;
        match parse(body, now()) {
            Err(ParseError::UnknownType { found }) => assert_eq!(found, "subscription"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_id_is_rejected() {
        for body in [
            br#"{"type":"payment"}"#.as_slice(),
            br#"{"type":"payment","data":{}}"#.as_slice(),
            br#"{"type":"payment","data":{"id":""}}"#.as_slice(),
            br#"{"type":"payment","data":{"id":null}}"#.as_slice(),
        ] {
            assert!(matches!(parse(body, now()), Err(ParseError::MissingId)));
        }
    }

    #[test]
    fn order_notifications_parse() {
        let body = br#"{"type":"order","data":{"id":"mo-9"}}"#;
        let event = parse(body, now()).expect("parse");
        assert_eq!(event.event_type, EventType::Order);
        assert_eq!(event.external_id, "mo-9");
    }
}
