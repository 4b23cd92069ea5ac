//! TON wallet gateway.
//!
//! Balance reads go to the public toncenter v2 HTTP API. Transfers are
//! signed outside this process: payments are handed to a signer service
//! that holds the wallet key and broadcasts the external message.
//!
//! toncenter: https://toncenter.com/api/v2/
//! Auth: optional `X-API-Key` for toncenter (higher rate limit);
//! bearer secret for the signer.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::WalletGateway;
use crate::types::{nano_from_ton, ton_from_nano, BidReceipt, TxReceipt, WalletError};

pub const DEFAULT_TONCENTER_URL: &str = "https://toncenter.com/api/v2";

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

/// toncenter envelope: `{"ok": true, "result": "123"}`.
#[derive(Debug, Deserialize)]
struct ToncenterResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Body sent to the signer's `/transfer` endpoint.
#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    destination: &'a str,
    amount_nano: u64,
    /// Base64 BOC body for the internal message.
    payload: &'a str,
    /// `class:item_id`, for the signer's audit log.
    reference: String,
    /// Unique per request; the signer rejects replays.
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    ok: bool,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

pub struct TonWallet {
    http: Client,
    toncenter_url: String,
    api_key: Option<SecretString>,
    address: String,
    signer_url: String,
    signer_secret: SecretString,
}

impl TonWallet {
    pub fn new(
        toncenter_url: &str,
        api_key: Option<SecretString>,
        address: &str,
        signer_url: &str,
        signer_secret: SecretString,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build TON HTTP client")?;

        Ok(Self {
            http,
            toncenter_url: toncenter_url.trim_end_matches('/').to_string(),
            api_key,
            address: address.to_string(),
            signer_url: signer_url.trim_end_matches('/').to_string(),
            signer_secret,
        })
    }
}

#[async_trait]
impl WalletGateway for TonWallet {
    async fn balance(&self) -> Result<Decimal, WalletError> {
        let url = format!("{}/getAddressBalance", self.toncenter_url);
        let mut req = self.http.get(&url).query(&[("address", self.address.as_str())]);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| WalletError::Transport(format!("toncenter request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| WalletError::Transport(format!("toncenter body: {e}")))?;
        if !status.is_success() {
            return Err(WalletError::Transport(format!("toncenter error {status}: {body}")));
        }

        let balance = parse_balance(&body)?;
        debug!(address = %self.address, balance = %balance, "Wallet balance");
        Ok(balance)
    }

    async fn pay(&self, amount: Decimal, bid: &BidReceipt) -> Result<TxReceipt, WalletError> {
        let amount_nano = nano_from_ton(amount)
            .filter(|n| *n > 0)
            .ok_or_else(|| WalletError::Payment(format!("Invalid payment amount {amount}")))?;

        let request = TransferRequest {
            destination: &bid.destination,
            amount_nano,
            payload: &bid.payload,
            reference: format!("{}:{}", bid.class, bid.item_id),
            request_id: Uuid::new_v4().to_string(),
        };

        info!(
            request_id = %request.request_id,
            to = %bid.destination,
            amount = %amount,
            item_id = %bid.item_id,
            "Submitting TON transfer"
        );

        let resp = self
            .http
            .post(format!("{}/transfer", self.signer_url))
            .bearer_auth(self.signer_secret.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| WalletError::Transport(format!("signer request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| WalletError::Transport(format!("signer body: {e}")))?;
        if status.is_server_error() {
            return Err(WalletError::Transport(format!("signer error {status}: {body}")));
        }

        // 4xx bodies still carry {"ok": false, "error": ...}
        let tx_ref = parse_transfer(&body)?;

        Ok(TxReceipt {
            tx_ref,
            destination: bid.destination.clone(),
            amount,
            timestamp: Utc::now(),
        })
    }

    fn address(&self) -> &str {
        &self.address
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse a `getAddressBalance` body into TON.
fn parse_balance(body: &str) -> Result<Decimal, WalletError> {
    let resp: ToncenterResponse = serde_json::from_str(body)
        .map_err(|e| WalletError::Transport(format!("Bad toncenter response: {e}")))?;
    if !resp.ok {
        return Err(WalletError::Transport(
            resp.error.unwrap_or_else(|| "toncenter returned ok=false".into()),
        ));
    }
    let nano = match resp.result {
        Some(serde_json::Value::String(s)) => s.parse::<u64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        _ => None,
    }
    .ok_or_else(|| WalletError::Transport("toncenter balance missing".into()))?;
    Ok(ton_from_nano(nano))
}

/// Parse the signer's answer into a transaction reference.
fn parse_transfer(body: &str) -> Result<String, WalletError> {
    let resp: TransferResponse = serde_json::from_str(body)
        .map_err(|e| WalletError::Payment(format!("Bad signer response: {e}")))?;
    match (resp.ok, resp.tx_hash) {
        (true, Some(hash)) if !hash.is_empty() => Ok(hash),
        (true, _) => Err(WalletError::Payment("Signer accepted transfer without a hash".into())),
        (false, _) => Err(WalletError::Payment(
            resp.error.unwrap_or_else(|| "transfer_failed".into()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
