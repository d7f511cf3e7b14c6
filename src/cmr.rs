use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Endpoints;
use crate::error::SyncError;
use crate::query::SearchQuery;

pub const SCROLL_ID_HEADER: &str = "CMR-Scroll-Id";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RelatedUrl {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Subtype", default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GranuleUmm {
    #[serde(rename = "GranuleUR", default, skip_serializing_if = "Option::is_none")]
    pub granule_ur: Option<String>,
    #[serde(rename = "RelatedUrls", default)]
    pub related_urls: Vec<RelatedUrl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GranuleMeta {
    #[serde(rename = "concept-id", default, skip_serializing_if = "Option::is_none")]
    pub concept_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GranuleRecord {
    #[serde(default)]
    pub meta: GranuleMeta,
    #[serde(default)]
    pub umm: GranuleUmm,
}

#[derive(Debug, Clone, Deserialize)]
struct UmmJsonResponse {
    hits: u64,
    #[serde(default)]
    items: Vec<GranuleRecord>,
}

/// One page of a granule search.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: u64,
    pub items: Vec<GranuleRecord>,
    pub scroll_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub hits: u64,
    pub items: Vec<GranuleRecord>,
    pub pages: usize,
    pub truncated: bool,
}

pub trait CatalogClient: Send + Sync {
    /// Runs one page of `query`. `scroll_id` continues an open scroll session.
    fn search_page(
        &self,
        query: &SearchQuery,
        scroll_id: Option<&str>,
    ) -> Result<SearchPage, SyncError>;

    fn clear_scroll(&self, _scroll_id: &str) -> Result<(), SyncError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct CmrHttpClient {
    client: Client,
    search_url: String,
    clear_scroll_url: String,
}

impl CmrHttpClient {
    pub fn new(endpoints: &Endpoints, timeout: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("earthdata-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::CmrHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::CmrHttp(err.to_string()))?;
        Ok(Self {
            client,
            search_url: endpoints.search_url(),
            clear_scroll_url: endpoints.clear_scroll_url(),
        })
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "CMR request failed".to_string());
        Err(SyncError::CmrStatus { status, message })
    }
}

impl CatalogClient for CmrHttpClient {
    fn search_page(
        &self,
        query: &SearchQuery,
        scroll_id: Option<&str>,
    ) -> Result<SearchPage, SyncError> {
        let url = query.url(&self.search_url)?;
        let mut request = self.client.get(url);
        if let Some(scroll_id) = scroll_id {
            request = request.header(SCROLL_ID_HEADER, scroll_id);
        }
        let response = request
            .send()
            .map_err(|err| SyncError::CmrHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let scroll_id = response
            .headers()
            .get(SCROLL_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let body = response
            .text()
            .map_err(|err| SyncError::CmrHttp(err.to_string()))?;
        let mut page = parse_search_response(&body)?;
        page.scroll_id = scroll_id;
        Ok(page)
    }

    fn clear_scroll(&self, scroll_id: &str) -> Result<(), SyncError> {
        let response = self
            .client
            .post(&self.clear_scroll_url)
            .json(&serde_json::json!({ "scroll_id": scroll_id }))
            .send()
            .map_err(|err| SyncError::CmrHttp(err.to_string()))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

pub fn parse_search_response(body: &str) -> Result<SearchPage, SyncError> {
    let parsed: UmmJsonResponse =
        serde_json::from_str(body).map_err(|err| SyncError::CmrResponse(err.to_string()))?;
    Ok(SearchPage {
        hits: parsed.hits,
        items: parsed.items,
        scroll_id: None,
    })
}

/// Runs `query` and, when `paginate` is set, keeps scrolling until every hit
/// has been collected or the server returns an empty page.
pub fn search_all<C: CatalogClient + ?Sized>(
    client: &C,
    query: &SearchQuery,
    paginate: bool,
) -> Result<SearchResults, SyncError> {
    let first = client.search_page(query, None)?;
    let hits = first.hits;
    let mut items = first.items;
    let mut pages = 1usize;
    let scroll_id = first.scroll_id;

    let outcome = if paginate {
        scroll_remaining(
            client,
            query,
            hits,
            &mut items,
            &mut pages,
            scroll_id.as_deref(),
        )
    } else {
        Ok(())
    };
    if let Some(id) = &scroll_id {
        if let Err(err) = client.clear_scroll(id) {
            debug!("failed to clear CMR scroll session: {err}");
        }
    }
    outcome?;

    let truncated = (items.len() as u64) < hits;
    if truncated {
        warn!(
            hits,
            received = items.len(),
            pages,
            "search results are incomplete; missing granules are not downloaded"
        );
    }
    info!(hits, records = items.len(), pages, "search finished");
    Ok(SearchResults {
        hits,
        items,
        pages,
        truncated,
    })
}

fn scroll_remaining<C: CatalogClient + ?Sized>(
    client: &C,
    query: &SearchQuery,
    hits: u64,
    items: &mut Vec<GranuleRecord>,
    pages: &mut usize,
    scroll_id: Option<&str>,
) -> Result<(), SyncError> {
    while (items.len() as u64) < hits {
        let Some(id) = scroll_id else {
            warn!("CMR did not return a scroll id; stopping after the first page");
            break;
        };
        let page = client.search_page(query, Some(id))?;
        if page.items.is_empty() {
            break;
        }
        *pages += 1;
        debug!(page = *pages, records = page.items.len(), "fetched search page");
        items.extend(page.items);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const RESPONSE: &str = r#"{
      "hits": 1,
      "took": 42,
      "items": [{
        "meta": {"concept-id": "G2040171468-POCLOUD", "provider-id": "POCLOUD"},
        "umm": {
          "GranuleUR": "S6A_P4_2__LR_RED__NR_002_245",
          "RelatedUrls": [
            {"URL": "https://archive.podaac.earthdata.nasa.gov/s6/a.nc", "Type": "GET DATA"},
            {"URL": "https://opendap.earthdata.nasa.gov/s6/a", "Type": "GET DATA", "Subtype": "OPENDAP DATA"},
            {"URL": "https://archive.podaac.earthdata.nasa.gov/s6/a.nc.md5", "Type": "EXTENDED METADATA"}
          ]
        }
      }]
    }"#;

    #[test]
    fn parse_umm_json_page() {
        let page = parse_search_response(RESPONSE).unwrap();
        assert_eq!(page.hits, 1);
        assert_eq!(page.items.len(), 1);
        let record = &page.items[0];
        assert_eq!(record.meta.concept_id.as_deref(), Some("G2040171468-POCLOUD"));
        assert_eq!(record.umm.related_urls.len(), 3);
        assert_eq!(
            record.umm.related_urls[1].subtype.as_deref(),
            Some("OPENDAP DATA")
        );
    }

    #[test]
    fn record_without_related_urls_is_empty() {
        let page = parse_search_response(r#"{"hits": 1, "items": [{"umm": {}}]}"#).unwrap();
        assert!(page.items[0].umm.related_urls.is_empty());
    }

    #[test]
    fn malformed_body_is_response_error() {
        assert_matches!(
            parse_search_response("<html>maintenance</html>"),
            Err(SyncError::CmrResponse(_))
        );
    }
}
