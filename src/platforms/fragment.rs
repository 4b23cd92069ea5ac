//! Fragment marketplace integration.
//!
//! Fragment has no public listing API, so sale listings are scraped from
//! the HTML tables and bids go through the site's internal `api` endpoint
//! (`getBidLink`), which answers with TonConnect transfer instructions.
//!
//! Numbers: https://fragment.com/numbers?filter=sale
//! Usernames: https://fragment.com/?sort=price_asc&filter=sale
//! Auth: session cookies copied from a logged-in browser (`FRAGMENT_COOKIES`).

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::MarketplaceClient;
use crate::types::{BidReceipt, Item, ItemClass, ItemStatus, MarketError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://fragment.com";
const PLATFORM_NAME: &str = "fragment";
const USER_AGENT: &str = "Mozilla/5.0";

/// Mainnet chain id as Fragment expects it in the account payload.
const TON_MAINNET_CHAIN: &str = "-239";

/// Minimum length of the hex hash embedded in item pages.
const MIN_API_HASH_LEN: usize = 16;

impl ItemClass {
    /// `type` parameter of `getBidLink`.
    fn bid_type(&self) -> u8 {
        match self {
            ItemClass::Number => 3,
            ItemClass::Username => 1,
        }
    }

    fn sale_path(&self) -> &'static str {
        match self {
            ItemClass::Number => "/numbers?filter=sale",
            ItemClass::Username => "/?sort=price_asc&filter=sale",
        }
    }
}

// ---------------------------------------------------------------------------
// TonConnect payloads
// ---------------------------------------------------------------------------

/// Wallet identity sent with every bid, in TonConnect `account` shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentAccount {
    /// Raw (`0:<hex>`) wallet address.
    pub address: String,
    pub chain: String,
    /// Base64 BOC of the wallet's state init.
    pub wallet_state_init: String,
    pub public_key: String,
}

impl FragmentAccount {
    pub fn mainnet(address: String, public_key: String, wallet_state_init: String) -> Self {
        Self {
            address,
            chain: TON_MAINNET_CHAIN.to_string(),
            wallet_state_init,
            public_key,
        }
    }
}

/// TonConnect `device` payload, mimicking a desktop Tonkeeper.
pub fn default_device_payload() -> serde_json::Value {
    serde_json::json!({
        "platform": "windows",
        "appName": "tonkeeper",
        "appVersion": "4.2.4",
        "maxProtocolVersion": 2,
        "features": [
            "SendTransaction",
            { "name": "SendTransaction", "maxMessages": 255, "extraCurrencySupported": true },
            { "name": "SignData", "types": ["text", "binary", "cell"] }
        ]
    })
}

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

/// Response of `POST /api?hash=...` with `method=getBidLink`.
#[derive(Debug, Deserialize)]
struct BidLinkResponse {
    #[serde(default)]
    transaction: Option<BidTransaction>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BidTransaction {
    #[serde(default)]
    messages: Vec<BidMessage>,
}

#[derive(Debug, Deserialize)]
struct BidMessage {
    #[serde(default)]
    address: Option<String>,
    /// Nanotons; Fragment sends it as a string, tolerate numbers too.
    #[serde(default)]
    amount: Option<serde_json::Value>,
    #[serde(default)]
    payload: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct CachedPage {
    fetched: Instant,
    html: String,
}

/// Fragment marketplace client.
pub struct FragmentClient {
    http: Client,
    base_url: String,
    /// Pre-rendered `Cookie` header value.
    cookie_header: SecretString,
    account: FragmentAccount,
    cache_ttl: Duration,
    sale_pages: Mutex<HashMap<ItemClass, CachedPage>>,
}

impl FragmentClient {
    /// Create a client.
    ///
    /// `cookies` is the raw `k=v; k2=v2` string from the browser session.
    /// `cache_ttl` bounds how long a scraped sale page is reused.
    pub fn new(
        base_url: &str,
        cookies: &SecretString,
        account: FragmentAccount,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build Fragment HTTP client")?;

        let pairs = parse_cookies(cookies.expose_secret());
        if pairs.is_empty() {
            warn!("No Fragment session cookies configured; bids will be rejected");
        }
        let cookie_header = SecretString::new(
            pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        );

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cookie_header,
            account,
            cache_ttl,
            sale_pages: Mutex::new(HashMap::new()),
        })
    }

    fn item_url(&self, class: ItemClass, item_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            class.as_str(),
            urlencoding::encode(item_id)
        )
    }

    async fn get_html(&self, url: &str) -> Result<String, MarketError> {
        let resp = self
            .http
            .get(url)
            .header(reqwest::header::COOKIE, self.cookie_header.expose_secret())
            .send()
            .await
            .map_err(|e| MarketError::Transport(format!("GET {url}: {e}")))?;

        check_status(resp)
            .await?
            .text()
            .await
            .map_err(|e| MarketError::Transport(format!("Reading {url}: {e}")))
    }

    /// Fetch the sale page for a class, reusing a fresh cached copy.
    async fn fetch_sale_html(&self, class: ItemClass) -> Result<String, MarketError> {
        let cached = self
            .sale_pages
            .lock()
            .get(&class)
            .filter(|page| page.fetched.elapsed() < self.cache_ttl)
            .map(|page| page.html.clone());
        if let Some(html) = cached {
            debug!(%class, "Using cached Fragment sale page");
            return Ok(html);
        }

        let url = format!("{}{}", self.base_url, class.sale_path());
        let html = self.get_html(&url).await?;

        self.sale_pages.lock().insert(
            class,
            CachedPage {
                fetched: Instant::now(),
                html: html.clone(),
            },
        );
        Ok(html)
    }
}

#[async_trait]
impl MarketplaceClient for FragmentClient {
    async fn list(&self, class: ItemClass) -> Result<Vec<Item>, MarketError> {
        let html = self.fetch_sale_html(class).await?;
        let items = parse_listings(class, &html, &self.base_url)?;
        debug!(%class, count = items.len(), "Parsed Fragment listings");
        Ok(items)
    }

    async fn fetch_item(&self, class: ItemClass, item_id: &str) -> Result<Option<Item>, MarketError> {
        let items = self.list(class).await?;
        Ok(items.into_iter().find(|i| i.id == item_id))
    }

    async fn submit_bid(
        &self,
        class: ItemClass,
        item_id: &str,
        amount: Decimal,
    ) -> Result<BidReceipt, MarketError> {
        let page = self.get_html(&self.item_url(class, item_id)).await?;
        let api_hash = extract_api_hash(&page)
            .ok_or_else(|| MarketError::Auth(format!("No api hash on {class} page {item_id}; session expired?")))?;

        let account = serde_json::to_string(&self.account)
            .map_err(|e| MarketError::Parse(format!("Account payload: {e}")))?;
        let device = default_device_payload().to_string();
        let bid = amount.normalize().to_string();
        let bid_type = class.bid_type().to_string();

        info!(%class, item_id, bid = %bid, "Requesting Fragment bid link");

        let url = format!("{}/api", self.base_url);
        let resp = self
            .http
            .post(&url)
            .query(&[("hash", api_hash.as_str())])
            .header(reqwest::header::COOKIE, self.cookie_header.expose_secret())
            .form(&[
                ("method", "getBidLink"),
                ("transaction", "1"),
                ("type", bid_type.as_str()),
                ("username", item_id),
                ("bid", bid.as_str()),
                ("account", account.as_str()),
                ("device", device.as_str()),
            ])
            .send()
            .await
            .map_err(|e| MarketError::Transport(format!("getBidLink: {e}")))?;

        let body = check_status(resp)
            .await?
            .text()
            .await
            .map_err(|e| MarketError::Transport(format!("getBidLink body: {e}")))?;

        parse_bid_link(class, item_id, &body)
    }

    fn name(&self) -> &str {
        PLATFORM_NAME
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Map HTTP status to the marketplace error taxonomy.
async fn check_status(resp: Response) -> Result<Response, MarketError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(MarketError::Auth(format!("Fragment returned {status}")))
        }
        _ => Err(MarketError::Transport(format!("Fragment error {status}: {body}"))),
    }
}

/// Split a `k=v; k2=v2` cookie string into trimmed pairs.
/// Surrounding quotes left over from `.env` files are stripped.
pub fn parse_cookies(raw: &str) -> Vec<(String, String)> {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .split(';')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Parse the first number out of a price cell (`"1,250 TON"` → 1250).
pub fn parse_price(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '\u{a0}'))
        .collect();
    let start = cleaned.find(|c: char| c.is_ascii_digit())?;
    let number: String = cleaned[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    Decimal::from_str(number.trim_end_matches('.')).ok()
}

/// Find the `api?hash=<hex>` token embedded in an item page's scripts.
pub fn extract_api_hash(html: &str) -> Option<String> {
    const MARKER: &str = "api?hash=";
    let mut rest = html;
    while let Some(pos) = rest.find(MARKER) {
        rest = &rest[pos + MARKER.len()..];
        let hash: String = rest
            .chars()
            .take_while(|c| matches!(c, '0'..='9' | 'a'..='f'))
            .collect();
        if hash.len() >= MIN_API_HASH_LEN {
            return Some(hash);
        }
    }
    None
}

fn selector(css: &str) -> Result<Selector, MarketError> {
    Selector::parse(css).map_err(|e| MarketError::Parse(format!("Bad selector {css}: {e}")))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().map(str::trim).collect::<String>()
}

fn status_from_text(text: Option<&str>) -> ItemStatus {
    match text.map(|t| t.to_lowercase()) {
        Some(t) if t.contains("sold") => ItemStatus::Unavailable,
        _ => ItemStatus::Listed,
    }
}

/// Parse a Fragment sale table into items.
///
/// Rows without a link or a parseable price are skipped.
pub fn parse_listings(class: ItemClass, html: &str, base_url: &str) -> Result<Vec<Item>, MarketError> {
    let doc = Html::parse_document(html);
    let row_sel = selector(match class {
        ItemClass::Number => "table tr.tm-row-selectable",
        ItemClass::Username => "table tr",
    })?;
    let link_sel = selector(match class {
        ItemClass::Number => "td a.table-cell",
        ItemClass::Username => "td a[href*='/username/']",
    })?;
    let ton_sel = selector(".icon-before.icon-ton")?;
    let label_sel = selector(".table-cell-value")?;
    let status_sel = selector(".tm-status-avail, .tm-status-sold, .tm-status-bid")?;
    let header_sel = selector("th")?;
    let cell_sel = selector("td")?;

    let mut items = Vec::new();

    for row in doc.select(&row_sel) {
        if row.select(&header_sel).next().is_some() {
            continue;
        }
        let Some(link) = row.select(&link_sel).next() else {
            continue;
        };
        let href = link.value().attr("href").unwrap_or_default();
        let id = href.rsplit('/').next().unwrap_or_default().to_string();
        if id.is_empty() {
            continue;
        }

        let price = match row.select(&ton_sel).next() {
            Some(cell) => parse_price(&element_text(cell)),
            // Older username tables have no TON icon; take the first priced cell.
            None => row
                .select(&cell_sel)
                .skip(1)
                .map(element_text)
                .find_map(|t| parse_price(&t)),
        };
        let Some(price) = price else {
            debug!(%class, id = %id, "Skipping row without price");
            continue;
        };

        let label = row
            .select(&label_sel)
            .next()
            .map(element_text)
            .unwrap_or_else(|| element_text(link));
        let label = label.trim_start_matches('@').to_string();

        let status_text = row.select(&status_sel).next().map(element_text);

        items.push(Item {
            url: format!("{}/{}/{}", base_url, class.as_str(), id),
            id,
            class,
            label,
            price,
            status: status_from_text(status_text.as_deref()),
        });
    }

    Ok(items)
}

/// Turn a `getBidLink` response body into payment instructions.
fn parse_bid_link(class: ItemClass, item_id: &str, body: &str) -> Result<BidReceipt, MarketError> {
    let parsed: BidLinkResponse = serde_json::from_str(body)
        .map_err(|e| MarketError::Parse(format!("getBidLink response: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(MarketError::Rejected(err));
    }

    let msg = parsed
        .transaction
        .and_then(|tx| tx.messages.into_iter().next())
        .ok_or_else(|| MarketError::Rejected("No messages in getBidLink response".into()))?;

    let amount_nano = match msg.amount {
        Some(serde_json::Value::String(s)) => s.parse::<u64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        _ => None,
    };

    match (msg.address, amount_nano) {
        (Some(destination), Some(amount_nano)) if !destination.is_empty() && amount_nano > 0 => {
            Ok(BidReceipt {
                item_id: item_id.to_string(),
                class,
                destination,
                amount_nano,
                payload: msg.payload.unwrap_or_default(),
            })
        }
        _ => Err(MarketError::Rejected("Incomplete message in getBidLink response".into())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
