//! HTTP client for the nearby-business search API
//!
//! Features:
//! - Rate limiting with governor (requests are issued one at a time)
//! - Center query first, sub-sample queries only when the center saturates
//! - Deduplication of businesses across overlapping queries

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::USER_AGENT, Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;

use super::{SearchClient, SearchOutcome};
use crate::config::SearchConfig;
use crate::grid::{generate_search_points, validate_coverage, Coverage, GeoPoint};
use crate::models::{Business, BusinessSet, CoverageQuality};
use crate::utils::error::SearchError;

const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Deserialize)]
struct NearbyResponse {
    #[serde(default)]
    results: Vec<Business>,
}

/// Search client backed by the business search HTTP API
pub struct HttpSearchClient {
    /// HTTP client with configured timeout and compression
    client: Client,

    /// Rate limiter to control request frequency
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    base_url: String,
    api_key: Option<String>,
    user_agent: String,

    /// Result count at which a single query is considered saturated
    per_query_cap: u32,
}

impl HttpSearchClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns `SearchError::Http` if the HTTP client cannot be created
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .gzip(true)
            .build()?;

        let rate = NonZeroU32::new(config.rate_limit.ceil() as u32).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            rate_limiter,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            user_agent: config.user_agent.clone(),
            per_query_cap: config.per_query_cap,
        })
    }

    /// Query businesses around one point
    async fn query_point(&self, point: &GeoPoint, radius_m: f64) -> Result<Vec<Business>, SearchError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/places/nearby", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .header(USER_AGENT, &self.user_agent)
            .query(&[
                ("lat", point.lat.to_string()),
                ("lng", point.lng.to_string()),
                ("radius", format!("{:.0}", radius_m.ceil())),
                ("limit", self.per_query_cap.to_string()),
            ]);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SearchError::Timeout
            } else {
                SearchError::Http(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SearchError::RateLimit);
        }
        if status.is_server_error() {
            return Err(SearchError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(SearchError::ClientError(status.as_u16()));
        }

        let body: NearbyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))?;
        Ok(body.results)
    }

    fn is_saturated(&self, count: usize) -> bool {
        count >= self.per_query_cap as usize
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search_cell(&self, cell_id: &str) -> Result<SearchOutcome, SearchError> {
        let coverage = generate_search_points(cell_id)?;
        let mut items = BusinessSet::new();

        let center = self
            .query_point(&coverage.center, coverage.cell_radius_m)
            .await?;
        let mut api_calls = 1;
        let saturated = self.is_saturated(center.len());
        items.extend(center);

        if !saturated {
            return Ok(SearchOutcome::new(
                items.into_vec(),
                CoverageQuality::Excellent,
                api_calls,
            ));
        }

        let Some(sub_points) = sub_points_to_sample(&coverage) else {
            tracing::warn!(cell_id, "Coverage failed validation, keeping center-only results");
            return Ok(SearchOutcome::new(
                items.into_vec(),
                CoverageQuality::Poor,
                api_calls,
            ));
        };

        tracing::debug!(
            cell_id,
            sub_points = sub_points.len(),
            "Center query saturated, sampling sub-points"
        );

        let mut failed_points = 0;
        for point in sub_points {
            api_calls += 1;
            match self.query_point(point, coverage.search_radius_m).await {
                Ok(found) => items.extend(found),
                Err(SearchError::RateLimit) => {
                    tracing::warn!(cell_id, "Rate limited during sub-point sampling, stopping early");
                    failed_points += 1;
                    break;
                }
                Err(e) => {
                    tracing::warn!(cell_id, error = %e, "Sub-point query failed");
                    failed_points += 1;
                }
            }
        }

        let quality = if failed_points == 0 {
            CoverageQuality::Good
        } else {
            CoverageQuality::Fair
        };
        Ok(SearchOutcome::new(items.into_vec(), quality, api_calls))
    }
}

/// Sub-points worth querying, `None` when the coverage is not trustworthy
fn sub_points_to_sample(coverage: &Coverage) -> Option<&[GeoPoint]> {
    validate_coverage(coverage).then_some(coverage.sub_points.as_slice())
}
