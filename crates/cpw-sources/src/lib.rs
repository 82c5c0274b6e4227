//! Source contracts plus the concrete catalog upstreams.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cpw_core::RawItem;
use cpw_storage::{FetchError, HttpFetcher, RetryDisposition, Url};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "cpw-sources";

pub const RECO_SOURCE_ID: &str = "reco";
pub const GAMEPASS_SOURCE_ID: &str = "gamepass";
pub const STOREFRONT_SOURCE_ID: &str = "storefront";

const DEFAULT_RECO_URL: &str =
    "https://reco-public.rec.mp.microsoft.com/channels/Reco/V8.0/Lists/Computed/pc";
const DEFAULT_SIGLS_URL: &str = "https://catalog.gamepass.com/sigls/v2";
const DEFAULT_DISPLAYCATALOG_URL: &str = "https://displaycatalog.mp.microsoft.com/v7.0/products";
const DEFAULT_STOREFRONT_URL: &str = "https://www.xbox.com";
const PC_PLATFORM: &str = "Windows.Desktop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Api,
    PublicHtml,
}

/// `None` at the call site means the first page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cursor {
    Offset(usize),
    Token(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<RawItem>,
    pub next: Option<Cursor>,
}

impl Page {
    pub fn last(items: Vec<RawItem>) -> Self {
        Self { items, next: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => SourceError::Transient(err.to_string()),
            RetryDisposition::NonRetryable => SourceError::Permanent(err.to_string()),
        }
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketConfig {
    pub market: String,
    pub language: String,
}

impl MarketConfig {
    pub fn new(market: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            market: market.into(),
            language: language.into(),
        }
    }

        pub fn locale(&self) -> String {
        format!(
            "{}-{}",
            self.language.to_ascii_lowercase(),
            self.market.to_ascii_uppercase()
        )
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self::new("AR", "es")
    }
}

#[derive(Debug, Clone)]
pub struct SourceContext {
    pub http: Arc<HttpFetcher>,
    pub market: MarketConfig,
    pub page_size: usize,
}

fn malformed(source_id: &str, detail: impl std::fmt::Display) -> SourceError {
    SourceError::Transient(format!("{source_id}: malformed response: {detail}"))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub struct RecoCatalogSource {
    http: Arc<HttpFetcher>,
    endpoint: Url,
    market: MarketConfig,
    page_size: usize,
}

impl RecoCatalogSource {
    pub fn new(http: Arc<HttpFetcher>, endpoint: Url, market: MarketConfig, page_size: usize) -> Self {
        Self {
            http,
            endpoint,
            market,
            page_size: page_size.max(1),
        }
    }

    pub fn page_url(&self, skip: usize) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("Market", &self.market.market)
            .append_pair("Language", &self.market.language)
            .append_pair("ItemTypes", "Game")
            .append_pair("DeviceFamily", PC_PLATFORM)
            .append_pair("count", &self.page_size.to_string())
            .append_pair("skipitems", &skip.to_string());
        url
    }
}

#[async_trait]
impl Source for RecoCatalogSource {
    fn source_id(&self) -> &str {
        RECO_SOURCE_ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        let skip = match cursor {
            None => 0,
            Some(Cursor::Offset(skip)) => *skip,
            Some(other) => {
                return Err(SourceError::Permanent(format!(
                    "{RECO_SOURCE_ID}: unsupported cursor {other:?}"
                )))
            }
        };
        let url = self.page_url(skip);
        let resp = self
            .http
            .fetch_bytes(RECO_SOURCE_ID, &url, "application/json")
            .await?;
        parse_reco_page(&resp.body, skip, self.page_size)
    }
}

pub fn parse_reco_page(body: &[u8], skip: usize, page_size: usize) -> Result<Page, SourceError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| malformed(RECO_SOURCE_ID, e))?;
    if !value.is_object() {
        return Err(malformed(RECO_SOURCE_ID, "expected a JSON object"));
    }

    let items = json_array(&value, &["Items"])
        .iter()
        .map(|item| RawItem {
            id: json_str(item, &["Id"]).map(ToString::to_string),
            title: json_str(item, &["Title"]).map(ToString::to_string),
            price: json_at(item, &["Price", "ListPrice"]).cloned(),
            currency: json_str(item, &["Price", "CurrencyCode"]).map(ToString::to_string),
            link: json_str(item, &["Uri"]).map(ToString::to_string),
        })
        .collect::<Vec<_>>();

    let total = json_at(&value, &["PagingInfo", "TotalItems"]).and_then(JsonValue::as_u64);
    let next_skip = skip + page_size;
    let exhausted = items.len() < page_size
        || total.is_some_and(|total| next_skip as u64 >= total);
    let next = (!exhausted).then_some(Cursor::Offset(next_skip));

    Ok(Page { items, next })
}

pub struct GamePassSource {
    http: Arc<HttpFetcher>,
    sigls_url: Url,
    products_url: Url,
    market: MarketConfig,
    max_ids: usize,
    batch_size: usize,
    ids: Mutex<Vec<String>>,
}

impl GamePassSource {
    pub fn new(
        http: Arc<HttpFetcher>,
        sigls_url: Url,
        products_url: Url,
        market: MarketConfig,
        max_ids: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            http,
            sigls_url,
            products_url,
            market,
            max_ids,
            batch_size: batch_size.max(1),
            ids: Mutex::new(Vec::new()),
        }
    }

    fn sigls_request_url(&self) -> Url {
        let mut url = self.sigls_url.clone();
        url.query_pairs_mut()
            .append_pair("language", &self.market.locale().to_ascii_lowercase())
            .append_pair("market", &self.market.market)
            .append_pair("hydration", "MobileDetails");
        url
    }

    fn products_request_url(&self, ids: &[String]) -> Url {
        let mut url = self.products_url.clone();
        url.query_pairs_mut()
            .append_pair("bigIds", &ids.join(","))
            .append_pair("market", &self.market.market)
            .append_pair("languages", &self.market.locale())
            .append_pair("MS-CV", "DGU1mcuYo0WMMp+F.1");
        url
    }

    async fn load_ids(&self) -> Result<Vec<String>, SourceError> {
        let resp = self
            .http
            .fetch_bytes(GAMEPASS_SOURCE_ID, &self.sigls_request_url(), "application/json")
            .await?;
        parse_sigls_ids(&resp.body, self.max_ids)
    }
}

#[async_trait]
impl Source for GamePassSource {
    fn source_id(&self) -> &str {
        GAMEPASS_SOURCE_ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        let mut offset = match cursor {
            None => 0,
            Some(Cursor::Offset(offset)) => *offset,
            Some(other) => {
                return Err(SourceError::Permanent(format!(
                    "{GAMEPASS_SOURCE_ID}: unsupported cursor {other:?}"
                )))
            }
        };

        let ids = {
            let cached = self.ids.lock().await.clone();
            if cursor.is_none() || cached.is_empty() {
                let fresh = self.load_ids().await?;
                debug!(ids = fresh.len(), "loaded game pass id list");
                *self.ids.lock().await = fresh.clone();
                fresh
            } else {
                cached
            }
        };

        // A batch can lose every product to the PC filter; keep going so an
        // empty page really means the end of the list.
        while offset < ids.len() {
            let end = (offset + self.batch_size).min(ids.len());
            let url = self.products_request_url(&ids[offset..end]);
            let resp = self
                .http
                .fetch_bytes(GAMEPASS_SOURCE_ID, &url, "application/json")
                .await?;
            let items = parse_display_products(&resp.body, &self.market.locale())?;
            let next = (end < ids.len()).then_some(Cursor::Offset(end));
            if !items.is_empty() {
                return Ok(Page { items, next });
            }
            offset = end;
        }
        Ok(Page::default())
    }
}

pub fn parse_sigls_ids(body: &[u8], max_ids: usize) -> Result<Vec<String>, SourceError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| malformed(GAMEPASS_SOURCE_ID, e))?;
    let Some(rows) = value.as_array() else {
        return Err(malformed(GAMEPASS_SOURCE_ID, "expected a JSON array"));
    };
    let mut seen = HashSet::new();
    Ok(rows
        .iter()
        .filter_map(|row| json_str(row, &["id"]).and_then(text_or_none))
        .filter(|id| seen.insert(id.clone()))
        .take(max_ids)
        .collect())
}

pub fn parse_display_products(body: &[u8], locale: &str) -> Result<Vec<RawItem>, SourceError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| malformed(GAMEPASS_SOURCE_ID, e))?;
    if !value.is_object() {
        return Err(malformed(GAMEPASS_SOURCE_ID, "expected a JSON object"));
    }

    Ok(json_array(&value, &["Products"])
        .iter()
        .filter_map(|product| {
            let availabilities = product_availabilities(product);
            let pc: Vec<&JsonValue> = availabilities
                .into_iter()
                .filter(|av| {
                    json_array(av, &["Conditions", "ClientConditions", "AllowedPlatforms"])
                        .iter()
                        .any(|p| json_str(p, &["PlatformName"]) == Some(PC_PLATFORM))
                })
                .collect();
            if pc.is_empty() {
                return None;
            }

            let id = json_str(product, &["ProductId"]).map(ToString::to_string);
            let title = json_array(product, &["LocalizedProperties"])
                .iter()
                .find_map(|lp| json_str(lp, &["ProductTitle"]))
                .or_else(|| json_str(product, &["ProductTitle"]))
                .map(ToString::to_string);
            let price = pc
                .iter()
                .find_map(|av| json_at(av, &["OrderManagementData", "Price"]));
            let link = id
                .as_deref()
                .map(|id| format!("{DEFAULT_STOREFRONT_URL}/{locale}/games/store/_/{id}"));

            Some(RawItem {
                id,
                title,
                price: price.and_then(|p| p.get("ListPrice")).cloned(),
                currency: price
                    .and_then(|p| json_str(p, &["CurrencyCode"]))
                    .map(ToString::to_string),
                link,
            })
        })
        .collect())
}

fn product_availabilities(product: &JsonValue) -> Vec<&JsonValue> {
    let mut out: Vec<&JsonValue> = json_array(product, &["Availabilities"]).iter().collect();
    for sku in json_array(product, &["DisplaySkuAvailabilities"]) {
        out.extend(json_array(sku, &["Availabilities"]));
    }
    out
}

pub struct StorefrontScrapeSource {
    http: Arc<HttpFetcher>,
    base_url: Url,
    market: MarketConfig,
}

impl StorefrontScrapeSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: Url, market: MarketConfig) -> Self {
        Self {
            http,
            base_url,
            market,
        }
    }

    pub fn listing_url(&self) -> Result<Url, SourceError> {
        let mut url = self
            .base_url
            .join(&format!("/{}/games/all-games/pc", self.market.locale()))
            .map_err(|e| SourceError::Permanent(format!("{STOREFRONT_SOURCE_ID}: {e}")))?;
        url.query_pairs_mut().append_pair("PlayWith", "PC");
        Ok(url)
    }
}

#[async_trait]
impl Source for StorefrontScrapeSource {
    fn source_id(&self) -> &str {
        STOREFRONT_SOURCE_ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PublicHtml
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        if cursor.is_some() {
            return Ok(Page::default());
        }
        let url = self.listing_url()?;
        let resp = self
            .http
            .fetch_bytes(STOREFRONT_SOURCE_ID, &url, "text/html")
            .await?;
        let html = String::from_utf8_lossy(&resp.body);
        let items = parse_storefront_html(&html, &resp.final_url, &self.market.locale())?;
        Ok(Page::last(items))
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css)
        .map_err(|e| SourceError::Permanent(format!("{STOREFRONT_SOURCE_ID}: selector {css}: {e}")))
}

fn select_first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

pub fn parse_storefront_html(html: &str, page_url: &Url, locale: &str) -> Result<Vec<RawItem>, SourceError> {
    let document = Html::parse_document(html);
    let card_sel = selector("a[href*='/games/store/']")?;
    let title_sel = selector("[class*='title'], [class*='Title']")?;
    let price_sel = selector("[class*='price'], [class*='Price']")?;

    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for card in document.select(&card_sel) {
        let Some(href) = card.value().attr("href") else {
            continue;
        };
        let Ok(link) = page_url.join(href) else {
            continue;
        };
        let Some(id) = link
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(ToString::to_string)
        else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        let title = card
            .value()
            .attr("aria-label")
            .and_then(text_or_none)
            .or_else(|| select_first_text(&card, &title_sel))
            .or_else(|| text_or_none(&card.text().collect::<String>()));
        let price = select_first_text(&card, &price_sel).map(JsonValue::String);
        items.push(RawItem {
            id: Some(id),
            title,
            price,
            currency: None,
            link: Some(link.to_string()),
        });
    }

    for id in embedded_product_ids(html)? {
        if seen.insert(id.clone()) {
            let link = page_url
                .join(&format!("/{locale}/games/store/_/{id}"))
                .ok()
                .map(|u| u.to_string());
            items.push(RawItem {
                id: Some(id),
                link,
                ..Default::default()
            });
        }
    }

    Ok(items)
}

fn product_id_pattern() -> Result<&'static Regex, SourceError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#""productId":"(.*?)""#))
        .as_ref()
        .map_err(|e| SourceError::Permanent(format!("{STOREFRONT_SOURCE_ID}: product id pattern: {e}")))
}

fn embedded_product_ids(text: &str) -> Result<Vec<String>, SourceError> {
    Ok(product_id_pattern()?
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| text_or_none(m.as_str()))
        .collect())
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    fn builtin(source_id: &str, display_name: &str, kind: SourceKind, base_url: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            kind,
            base_url: Some(base_url.to_string()),
            detail_url: None,
            max_items: None,
            batch_size: None,
            notes: None,
        }
    }
}

pub fn default_source_configs() -> Vec<SourceConfig> {
    vec![
        SourceConfig::builtin(RECO_SOURCE_ID, "Catalog recommendations API", SourceKind::Api, DEFAULT_RECO_URL),
        SourceConfig {
            detail_url: Some(DEFAULT_DISPLAYCATALOG_URL.to_string()),
            max_items: Some(50),
            batch_size: Some(20),
            ..SourceConfig::builtin(GAMEPASS_SOURCE_ID, "Game Pass catalog", SourceKind::Api, DEFAULT_SIGLS_URL)
        },
        SourceConfig::builtin(STOREFRONT_SOURCE_ID, "Storefront listing page", SourceKind::PublicHtml, DEFAULT_STOREFRONT_URL),
    ]
}

fn parse_url(config: &SourceConfig, value: Option<&str>, default: &str) -> Result<Url> {
    let raw = value.unwrap_or(default);
    Url::parse(raw).with_context(|| format!("invalid url {raw:?} for source {}", config.source_id))
}

fn reco_source(config: &SourceConfig, ctx: &SourceContext) -> Result<RecoCatalogSource> {
    Ok(RecoCatalogSource::new(
        Arc::clone(&ctx.http),
        parse_url(config, config.base_url.as_deref(), DEFAULT_RECO_URL)?,
        ctx.market.clone(),
        ctx.page_size,
    ))
}

pub fn source_for_config(config: &SourceConfig, ctx: &SourceContext) -> Result<Arc<dyn Source>> {
    let source: Arc<dyn Source> = match config.source_id.as_str() {
        RECO_SOURCE_ID => Arc::new(reco_source(config, ctx)?),
        GAMEPASS_SOURCE_ID => Arc::new(GamePassSource::new(
            Arc::clone(&ctx.http),
            parse_url(config, config.base_url.as_deref(), DEFAULT_SIGLS_URL)?,
            parse_url(config, config.detail_url.as_deref(), DEFAULT_DISPLAYCATALOG_URL)?,
            ctx.market.clone(),
            config.max_items.unwrap_or(50),
            config.batch_size.unwrap_or(20),
        )),
        STOREFRONT_SOURCE_ID => Arc::new(StorefrontScrapeSource::new(
            Arc::clone(&ctx.http),
            parse_url(config, config.base_url.as_deref(), DEFAULT_STOREFRONT_URL)?,
            ctx.market.clone(),
        )),
        other => bail!("no source registered for {other}"),
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpw_storage::HttpClientConfig;
    use serde_json::json;

    fn context() -> SourceContext {
        SourceContext {
            http: Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            market: MarketConfig::default(),
            page_size: 100,
        }
    }

    #[test]
    fn locale_combines_language_and_market() {
        assert_eq!(MarketConfig::new("us", "EN").locale(), "en-US");
        assert_eq!(MarketConfig::default().locale(), "es-AR");
    }

    #[test]
    fn reco_page_url_carries_market_and_offset() {
        let ctx = context();
        let source = RecoCatalogSource::new(
            ctx.http,
            Url::parse(DEFAULT_RECO_URL).unwrap(),
            ctx.market,
            100,
        );
        let url = source.page_url(200);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("Market".into(), "AR".into())));
        assert!(pairs.contains(&("Language".into(), "es".into())));
        assert!(pairs.contains(&("count".into(), "100".into())));
        assert!(pairs.contains(&("skipitems".into(), "200".into())));
    }

    #[test]
    fn reco_page_without_items_is_last() {
        let page = parse_reco_page(br#"{"Items": []}"#, 0, 100).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next, None);
    }

    #[test]
    fn reco_full_page_without_total_continues() {
        let body = serde_json::to_vec(&json!({"Items": [{"Id": "A"}, {"Id": "B"}]})).unwrap();
        let page = parse_reco_page(&body, 4, 2).unwrap();
        assert_eq!(page.next, Some(Cursor::Offset(6)));
    }

    #[test]
    fn reco_rejects_non_json_as_transient() {
        let err = parse_reco_page(b"<html>busy</html>", 0, 100).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn sigls_ids_respect_cap() {
        let body = serde_json::to_vec(&json!([{"id": "A"}, {"id": "B"}, {"id": "C"}])).unwrap();
        assert_eq!(parse_sigls_ids(&body, 2).unwrap(), vec!["A", "B"]);
        assert!(parse_sigls_ids(br#"{"id": "A"}"#, 2).unwrap_err().is_transient());
    }

    #[test]
    fn embedded_ids_are_scanned_in_order() {
        let text = r#"x "productId":"A1" y "productId":"B2" z "productId":"#;
        assert_eq!(embedded_product_ids(text).unwrap(), vec!["A1", "B2"]);
    }

    #[test]
    fn registry_builds_every_builtin_source() {
        let ctx = context();
        let ids: Vec<String> = default_source_configs()
            .iter()
            .map(|cfg| source_for_config(cfg, &ctx).unwrap().source_id().to_string())
            .collect();
        assert_eq!(ids, vec![RECO_SOURCE_ID, GAMEPASS_SOURCE_ID, STOREFRONT_SOURCE_ID]);
    }

    #[test]
    fn reco_page_size_follows_context_not_batch_size() {
        let mut ctx = context();
        ctx.page_size = 40;
        let mut cfg = default_source_configs().remove(0);
        cfg.batch_size = Some(7);
        let source = reco_source(&cfg, &ctx).unwrap();
        let pairs: Vec<(String, String)> = source.page_url(0).query_pairs().into_owned().collect();
        assert!(pairs.contains(&("count".into(), "40".into())));
    }

    #[test]
    fn registry_rejects_unknown_source_and_bad_url() {
        let ctx = context();
        let mut cfg = default_source_configs().remove(0);
        cfg.base_url = Some("not a url".into());
        assert!(source_for_config(&cfg, &ctx).is_err());
        cfg.source_id = "nope".into();
        assert!(source_for_config(&cfg, &ctx).is_err());
    }

    #[test]
    fn storefront_listing_url_uses_locale() {
        let ctx = context();
        let source = StorefrontScrapeSource::new(
            ctx.http,
            Url::parse(DEFAULT_STOREFRONT_URL).unwrap(),
            ctx.market,
        );
        assert_eq!(
            source.listing_url().unwrap().as_str(),
            "https://www.xbox.com/es-AR/games/all-games/pc?PlayWith=PC"
        );
    }

    #[tokio::test]
    async fn storefront_has_a_single_page() {
        let ctx = context();
        let source = StorefrontScrapeSource::new(
            ctx.http,
            Url::parse(DEFAULT_STOREFRONT_URL).unwrap(),
            ctx.market,
        );
        let page = source.fetch_page(Some(&Cursor::Offset(1))).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn offset_sources_reject_token_cursor() {
        let ctx = context();
        let source = RecoCatalogSource::new(
            ctx.http,
            Url::parse(DEFAULT_RECO_URL).unwrap(),
            ctx.market,
            100,
        );
        let err = source
            .fetch_page(Some(&Cursor::Token("abc".into())))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn fetch_errors_map_to_source_error_kind() {
        let transient: SourceError = FetchError::HttpStatus {
            status: 502,
            url: "u".into(),
        }
        .into();
        let permanent: SourceError = FetchError::HttpStatus {
            status: 403,
            url: "u".into(),
        }
        .into();
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
    }
}
