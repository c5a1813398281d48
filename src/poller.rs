//! Periodic "latest reading" ingestion
//!
//! Shares the vendor client, and therefore its rate gate, with any running
//! backfill job.

use std::slice;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    backfill::stop_signal,
    database::ReadingWriter,
    errors::BackfillError,
    fetcher::PageFetcher,
    models::StationId,
};

pub struct LatestPoller {
    fetcher: PageFetcher,
    writer: ReadingWriter,
    station: StationId,
    interval: Duration,
}

impl LatestPoller {
    pub fn new(
        fetcher: PageFetcher,
        writer: ReadingWriter,
        station: StationId,
        interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            writer,
            station,
            interval,
        }
    }

    /// Fetch and store the newest reading, returning rows inserted
    pub async fn poll_once(&self) -> Result<u64, BackfillError> {
        match self.fetcher.fetch_latest(&self.station).await? {
            Some(reading) => {
                self.writer
                    .upsert(&self.station, slice::from_ref(&reading))
                    .await
            }
            None => Ok(0),
        }
    }

    /// Poll on the configured interval until `stop` turns true.
    ///
    /// Failures are logged and polling continues.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(
            "Polling latest readings for {} every {:?}",
            self.station, self.interval
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_signal(&mut stop) => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(0) => debug!("No new reading for {}", self.station),
                Ok(n) => info!("Stored {} new reading for {}", n, self.station),
                Err(e) => warn!("Latest reading poll failed: {}", e),
            }
        }

        info!("Latest reading poller stopped");
    }
}
