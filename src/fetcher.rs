//! Paged retrieval of station history

use std::sync::Arc;

use tracing::debug;

use crate::{
    client::RateLimitedHttpClient,
    errors::BackfillError,
    models::{Reading, StationId},
};

/// Walks the vendor's device history backwards in time
///
/// The vendor returns at most `page_limit` readings per call, newest first,
/// ending at or before the requested `endDate`.
#[derive(Clone)]
pub struct PageFetcher {
    client: Arc<RateLimitedHttpClient>,
    page_limit: usize,
}

impl PageFetcher {
    pub fn new(client: Arc<RateLimitedHttpClient>, page_limit: usize) -> Self {
        Self { client, page_limit }
    }

    pub fn client(&self) -> &Arc<RateLimitedHttpClient> {
        &self.client
    }

    /// Lazily page through all readings in `[window_start, window_end]`.
    ///
    /// Nothing is requested until [`RangePages::next_page`] is awaited.
    pub fn fetch_range(
        &self,
        station: &StationId,
        window_start: i64,
        window_end: i64,
    ) -> RangePages<'_> {
        RangePages {
            fetcher: self,
            station: station.clone(),
            window_start,
            cursor: window_end,
            done: window_end < window_start,
            requests: 0,
        }
    }

    /// Newest reading the station has reported
    pub async fn fetch_latest(
        &self,
        station: &StationId,
    ) -> Result<Option<Reading>, BackfillError> {
        let mut requests = 0;
        let body = self
            .client
            .fetch(
                &device_path(station),
                &[("limit", "1".to_string())],
                &mut requests,
            )
            .await?;
        debug!("Latest reading for {} took {} requests", station, requests);
        let readings: Vec<Reading> = serde_json::from_value(body)?;
        Ok(readings.into_iter().max_by_key(|r| r.timestamp))
    }

    async fn fetch_page(
        &self,
        station: &StationId,
        end: i64,
        requests: &mut u64,
    ) -> Result<Vec<Reading>, BackfillError> {
        let body = self
            .client
            .fetch(
                &device_path(station),
                &[
                    ("endDate", end.to_string()),
                    ("limit", self.page_limit.to_string()),
                ],
                requests,
            )
            .await?;
        Ok(serde_json::from_value(body)?)
    }
}

fn device_path(station: &StationId) -> String {
    format!("devices/{}", station)
}

/// Finite, lazy sequence of pages for one window
pub struct RangePages<'a> {
    fetcher: &'a PageFetcher,
    station: StationId,
    window_start: i64,
    cursor: i64,
    done: bool,
    requests: u64,
}

impl RangePages<'_> {
    /// Fetch the next page, `None` once the window is exhausted.
    ///
    /// Readings older than the window start are dropped. Order and
    /// duplicates within a page are passed through as the vendor sent them.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Reading>>, BackfillError> {
        if self.done {
            return Ok(None);
        }

        let page = self
            .fetcher
            .fetch_page(&self.station, self.cursor, &mut self.requests)
            .await?;

        let Some(oldest) = page.iter().map(|r| r.timestamp).min() else {
            debug!("Empty page at {} for {}", self.cursor, self.station);
            self.done = true;
            return Ok(None);
        };

        let short_page = page.len() < self.fetcher.page_limit;
        if short_page || oldest <= self.window_start {
            self.done = true;
        } else {
            self.cursor = oldest - 1;
        }

        let window_start = self.window_start;
        Ok(Some(
            page.into_iter()
                .filter(|r| r.timestamp >= window_start)
                .collect(),
        ))
    }

    /// Drain every remaining page
    pub async fn collect_all(&mut self) -> Result<Vec<Reading>, BackfillError> {
        let mut readings = Vec::new();
        while let Some(page) = self.next_page().await? {
            readings.extend(page);
        }
        Ok(readings)
    }

    /// Requests sent so far, including rate limited attempts
    pub fn requests_made(&self) -> u64 {
        self.requests
    }
}
