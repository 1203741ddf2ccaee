use crate::error::{AppError, StoreError};
use crate::models::DailyUsage;
use crate::storage::SettingsStore;
use chrono::{Local, NaiveDate};

const USAGE_KEY: &str = "dailyRequestCount";

/// Advisory per-day throttle for generation requests.
///
/// The count is persisted with the date it belongs to; reading it on a new day
/// resets it to zero.
#[derive(Debug, Clone)]
pub struct DailyRequestCounter {
    settings: SettingsStore,
    limit: u32,
}

impl DailyRequestCounter {
    pub fn new(settings: SettingsStore, limit: u32) -> Self {
        Self { settings, limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub async fn current(&self) -> Result<u32, StoreError> {
        self.current_on(today()).await
    }

    /// Fails with [`AppError::DailyLimitReached`] once today's count hits the limit.
    pub async fn ensure_available(&self) -> Result<(), AppError> {
        self.ensure_available_on(today()).await
    }

    /// Counts one successful generation request; returns the new count.
    pub async fn record_request(&self) -> Result<u32, StoreError> {
        self.record_request_on(today()).await
    }

    /// Today's count. A record from another day (or an unreadable one) is reset to zero.
    pub async fn current_on(&self, date: NaiveDate) -> Result<u32, StoreError> {
        let date_key = date_key(date);
        self.settings
            .update(USAGE_KEY, move |raw| match stored_count(raw, &date_key) {
                Some(count) => Ok((None, count)),
                None => {
                    log::info!("Starting daily request count for {}", date_key);
                    Ok((Some(encode(&date_key, 0)?), 0))
                }
            })
            .await
    }

    pub async fn ensure_available_on(&self, date: NaiveDate) -> Result<(), AppError> {
        let count = self.current_on(date).await?;
        if count >= self.limit {
            log::warn!("Daily request limit reached ({}/{})", count, self.limit);
            return Err(AppError::DailyLimitReached { limit: self.limit });
        }
        Ok(())
    }

    /// Increments the count in a single transaction so concurrent requests are all counted.
    pub async fn record_request_on(&self, date: NaiveDate) -> Result<u32, StoreError> {
        let date_key = date_key(date);
        let count = self
            .settings
            .update(USAGE_KEY, move |raw| {
                let count = stored_count(raw, &date_key).unwrap_or(0) + 1;
                Ok((Some(encode(&date_key, count)?), count))
            })
            .await?;
        log::debug!("Daily request count is now {}", count);
        Ok(count)
    }
}

// The stored count if the record is readable and belongs to `date_key`
fn stored_count(raw: Option<String>, date_key: &str) -> Option<u32> {
    let usage = match serde_json::from_str::<DailyUsage>(&raw?) {
        Ok(usage) => usage,
        Err(e) => {
            log::warn!("Resetting unreadable daily usage record: {}", e);
            return None;
        }
    };
    (usage.date == date_key).then_some(usage.count)
}

fn encode(date_key: &str, count: u32) -> Result<String, serde_json::Error> {
    serde_json::to_string(&DailyUsage {
        date: date_key.to_string(),
        count,
    })
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
