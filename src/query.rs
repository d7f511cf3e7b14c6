use serde::Serialize;
use url::Url;

use crate::auth::Token;
use crate::config::SearchFilter;
use crate::domain::{CyclePass, Timestamp};
use crate::error::SyncError;

/// Time or orbit window of one granule search. Exactly one is used per query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchWindow {
    /// Ingest-recency mode: granules created after the lower bound.
    CreatedSince { since: Timestamp },
    /// Explicit-range mode: granules whose temporal extent overlaps `start..end`.
    Temporal { start: Timestamp, end: Timestamp },
    CyclePass(CyclePass),
}

impl SearchWindow {
    pub fn describe(&self) -> String {
        match self {
            SearchWindow::CreatedSince { since } => format!("ingested since {since}"),
            SearchWindow::Temporal { start, end } => format!("temporal {start} to {end}"),
            SearchWindow::CyclePass(CyclePass { cycle, pass: Some(pass) }) => {
                format!("cycle {cycle} pass {pass}")
            }
            SearchWindow::CyclePass(CyclePass { cycle, pass: None }) => format!("cycle {cycle}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    window: SearchWindow,
    params: Vec<(String, String)>,
}

impl SearchQuery {
    pub fn window(&self) -> &SearchWindow {
        &self.window
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn url(&self, base: &str) -> Result<Url, SyncError> {
        let mut url = Url::parse(base)
            .map_err(|err| SyncError::InvalidConfig(format!("search url {base}: {err}")))?;
        url.query_pairs_mut().extend_pairs(self.params.iter());
        Ok(url)
    }

    /// The query URL with the token value masked, for logs and console output.
    pub fn redacted_url(&self, base: &str) -> Result<Url, SyncError> {
        let mut url = Url::parse(base)
            .map_err(|err| SyncError::InvalidConfig(format!("search url {base}: {err}")))?;
        url.query_pairs_mut()
            .extend_pairs(self.params.iter().map(|(key, value)| {
                if key == "token" {
                    (key.as_str(), "***")
                } else {
                    (key.as_str(), value.as_str())
                }
            }));
        Ok(url)
    }
}

/// Builds the query for an incremental sync run.
///
/// With `data_since` set the search runs in explicit-range mode keyed by concept id;
/// otherwise in ingest-recency mode keyed by short name, starting at `lower_bound`.
/// A missing lower bound without an override is an error, never an open-ended search.
pub fn build_sync_query(
    filter: &SearchFilter,
    lower_bound: Option<Timestamp>,
    now: Timestamp,
    token: &Token,
) -> Result<SearchQuery, SyncError> {
    let (collection, window) = match filter.data_since {
        Some(start) => {
            if start > now {
                return Err(SyncError::InvalidConfig(format!(
                    "data_since {start} is later than the search time {now}"
                )));
            }
            let concept_id = filter.concept_id.as_ref().ok_or_else(|| {
                SyncError::MissingCollection(
                    "data_since searches require collection.concept_id".to_string(),
                )
            })?;
            (
                ("collection_concept_id", concept_id.to_string()),
                SearchWindow::Temporal { start, end: now },
            )
        }
        None => {
            let since = lower_bound.ok_or_else(|| {
                SyncError::UnboundedSearch(
                    "no checkpoint and no data_since to bound created_at".to_string(),
                )
            })?;
            let short_name = filter.short_name.as_ref().ok_or_else(|| {
                SyncError::MissingCollection(
                    "incremental searches require collection.short_name".to_string(),
                )
            })?;
            (
                ("ShortName", short_name.clone()),
                SearchWindow::CreatedSince { since },
            )
        }
    };
    Ok(assemble(filter, collection, window, token))
}

/// Builds the one-off query for a single cycle (and optionally one pass).
pub fn build_cycle_query(
    filter: &SearchFilter,
    cycle_pass: CyclePass,
    token: &Token,
) -> Result<SearchQuery, SyncError> {
    let short_name = filter.short_name.as_ref().ok_or_else(|| {
        SyncError::MissingCollection("cycle searches require collection.short_name".to_string())
    })?;
    Ok(assemble(
        filter,
        ("ShortName", short_name.clone()),
        SearchWindow::CyclePass(cycle_pass),
        token,
    ))
}

fn assemble(
    filter: &SearchFilter,
    collection: (&str, String),
    window: SearchWindow,
    token: &Token,
) -> SearchQuery {
    let mut params = vec![
        ("scroll".to_string(), "true".to_string()),
        ("page_size".to_string(), filter.page_size.to_string()),
        ("sort_key".to_string(), filter.sort_key.clone()),
        (collection.0.to_string(), collection.1),
    ];
    match &window {
        SearchWindow::CreatedSince { since } => {
            params.push(("created_at".to_string(), since.to_string()));
        }
        SearchWindow::Temporal { start, end } => {
            params.push(("temporal".to_string(), format!("{start},{end}")));
        }
        SearchWindow::CyclePass(CyclePass { cycle, pass }) => {
            params.push(("cycle[]".to_string(), cycle.to_string()));
            if let Some(pass) = pass {
                params.push(("passes[0][pass]".to_string(), pass.to_string()));
            }
        }
    }
    params.push(("token".to_string(), token.as_str().to_string()));
    if let Some(bbox) = filter.bounding_box {
        params.push(("bounding_box".to_string(), bbox.to_string()));
    }
    SearchQuery { window, params }
}
