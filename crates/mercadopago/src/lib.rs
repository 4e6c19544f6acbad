use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the MercadoPago payments API.
///
/// Webhook notifications frequently carry only `data.id`; this client
/// resolves the payment behind such a notification into the fields the
/// state machine needs (status, order reference, amount).
#[derive(Clone)]
pub struct MercadoPagoClient {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl MercadoPagoClient {
    /// Creates a new client. `base_url` must end with a trailing slash,
    /// e.g. `https://api.mercadopago.com/`.
    pub fn new(access_token: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            access_token: access_token.into(),
        }
    }

    /// Fetches a payment resource by its provider-assigned id.
    pub async fn fetch_payment(&self, payment_id: &str) -> Result<PaymentResource, MercadoPagoError> {
        let url = self.base_url.join(&format!("v1/payments/{payment_id}"))?;

        let response = self
            .http
            .request(Method::GET, url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .send()
            .await?;

        parse_json(response).await
    }
}

/// Payment resource as returned by `GET /v1/payments/{id}`.
///
/// Only the fields webhook processing depends on are modelled; the real
/// resource carries dozens more.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaymentResource {
    pub status: String,
    /// Order id the merchant attached when creating the payment preference.
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub transaction_amount: Option<f64>,
    #[serde(default)]
    pub currency_id: Option<String>,
}

/// Errors produced by the MercadoPago client.
#[derive(Debug, Error)]
pub enum MercadoPagoError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, MercadoPagoError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MercadoPagoError::Status { status, body });
    }

    Ok(response.json().await?)
}
