#![allow(dead_code)]

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;
use tokio::sync::Notify;

use weather_backfill::{
    backfill::BackfillOrchestrator,
    client::{RateLimitedHttpClient, Transport, TransportResponse},
    config::{BackfillConfig, VendorConfig},
    database::Database,
    errors::BackfillError,
    fetcher::PageFetcher,
    models::{Reading, StationId},
};

pub const STATION: &str = "AA:BB:CC:DD:EE:FF";
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Canned failure served instead of data
#[derive(Debug, Clone)]
pub enum Fault {
    Status(u16),
    Network,
}

impl Fault {
    fn respond(&self) -> Result<TransportResponse, BackfillError> {
        match self {
            Fault::Status(status) => Ok(TransportResponse {
                status: *status,
                body: format!("simulated status {}", status),
            }),
            Fault::Network => Err(BackfillError::Network("connection reset".to_string())),
        }
    }
}

/// In-memory stand-in for the vendor device history endpoint
///
/// Serves stored readings newest first, at or before `endDate`, at most
/// `limit` per call.
pub struct FakeVendor {
    readings: Mutex<Vec<Reading>>,
    faults: Mutex<VecDeque<Fault>>,
    faults_from: Mutex<Vec<(i64, Fault)>>,
    hold_from: Mutex<Option<i64>>,
    held: Notify,
    released: Notify,
    calls: AtomicUsize,
}

impl FakeVendor {
    pub fn new(readings: Vec<Reading>) -> Arc<Self> {
        Arc::new(Self {
            readings: Mutex::new(readings),
            faults: Mutex::new(VecDeque::new()),
            faults_from: Mutex::new(Vec::new()),
            hold_from: Mutex::new(None),
            held: Notify::new(),
            released: Notify::new(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Serve `fault` for the next request
    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    /// Serve `fault` once, for the first request with `endDate >= end_ms`
    pub fn fault_from(&self, end_ms: i64, fault: Fault) {
        self.faults_from.lock().unwrap().push((end_ms, fault));
    }

    /// Leave requests with `endDate >= end_ms` unanswered until [`Self::release`]
    pub fn hold_from(&self, end_ms: i64) {
        *self.hold_from.lock().unwrap() = Some(end_ms);
    }

    /// Resolves once a request is being held
    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    pub fn release(&self) {
        *self.hold_from.lock().unwrap() = None;
        self.released.notify_waiters();
    }

    fn holds(&self, end: Option<i64>) -> bool {
        match (*self.hold_from.lock().unwrap(), end) {
            (Some(from), Some(end)) => end >= from,
            _ => false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeVendor {
    async fn get(
        &self,
        _url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, BackfillError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let param = |name: &str| {
            query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };
        let end = param("endDate").and_then(|v| v.parse::<i64>().ok());
        let limit = param("limit")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(288);

        loop {
            let released = self.released.notified();
            if !self.holds(end) {
                break;
            }
            self.held.notify_one();
            released.await;
        }

        if let Some(fault) = self.faults.lock().unwrap().pop_front() {
            return fault.respond();
        }
        if let Some(end) = end {
            let mut rules = self.faults_from.lock().unwrap();
            if let Some(pos) = rules.iter().position(|(from, _)| end >= *from) {
                let (_, fault) = rules.remove(pos);
                return fault.respond();
            }
        }

        let mut page: Vec<Reading> = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| end.map_or(true, |e| r.timestamp <= e))
            .cloned()
            .collect();
        page.sort_by_key(|r| Reverse(r.timestamp));
        page.truncate(limit);

        Ok(TransportResponse {
            status: 200,
            body: serde_json::to_string(&page)?,
        })
    }
}

pub fn station() -> StationId {
    StationId::try_from(STATION).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn ms(y: i32, m: u32, d: u32) -> i64 {
    date(y, m, d)
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

/// One reading per hour for `days` days starting at midnight of `start`
pub fn hourly_readings(start: NaiveDate, days: i64) -> Vec<Reading> {
    let first = start.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
    (0..days * 24)
        .map(|i| Reading {
            timestamp: first + i * HOUR_MS,
            temp_f: Some(30.0 + (i % 17) as f64),
            humidity: Some(40.0 + (i % 50) as f64),
            barom_rel_in: Some(29.9),
            wind_speed_mph: Some((i % 7) as f64),
            daily_rain_in: if i % 5 == 0 { Some(0.01) } else { None },
            ..Default::default()
        })
        .collect()
}

pub fn vendor_config(page_limit: usize) -> VendorConfig {
    VendorConfig {
        base_url: "http://vendor.test/v1".to_string(),
        api_key: "test-api-key".to_string(),
        application_key: "test-app-key".to_string(),
        mac_address: STATION.to_string(),
        min_interval: Duration::from_millis(1),
        cooldown: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        page_limit,
    }
}

pub fn backfill_config() -> BackfillConfig {
    BackfillConfig {
        chunk_size: Duration::from_secs(24 * 60 * 60),
        max_chunk_retries: 3,
        max_range_days: 3660,
        stale_after: Duration::from_secs(60),
    }
}

pub fn fetcher(vendor: &Arc<FakeVendor>, page_limit: usize) -> PageFetcher {
    fetcher_with(vendor, &vendor_config(page_limit))
}

pub fn fetcher_with(vendor: &Arc<FakeVendor>, config: &VendorConfig) -> PageFetcher {
    let client = RateLimitedHttpClient::new(vendor.clone(), config);
    PageFetcher::new(Arc::new(client), config.page_limit)
}

pub async fn setup_db() -> (TempDir, Database) {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open_path(&dir.path().join("weather.db"))
        .await
        .expect("open database");
    (dir, db)
}

/// Database, fake vendor and orchestrator wired together
pub struct Harness {
    _dir: TempDir,
    pub db: Database,
    pub vendor: Arc<FakeVendor>,
    pub orchestrator: BackfillOrchestrator,
}

pub async fn harness(readings: Vec<Reading>, page_limit: usize) -> Harness {
    harness_with(readings, page_limit, backfill_config()).await
}

pub async fn harness_with(
    readings: Vec<Reading>,
    page_limit: usize,
    settings: BackfillConfig,
) -> Harness {
    harness_with_vendor(readings, vendor_config(page_limit), settings).await
}

pub async fn harness_with_vendor(
    readings: Vec<Reading>,
    vendor_config: VendorConfig,
    settings: BackfillConfig,
) -> Harness {
    let (dir, db) = setup_db().await;
    let vendor = FakeVendor::new(readings);
    let orchestrator =
        BackfillOrchestrator::new(fetcher_with(&vendor, &vendor_config), &db, settings)
            .expect("orchestrator");
    Harness {
        _dir: dir,
        db,
        vendor,
        orchestrator,
    }
}
