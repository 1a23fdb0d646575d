use std::collections::HashSet;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use common::{Error, Market, Result};

/// Seoul is UTC+9 with no daylight saving.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("valid KST offset")
}

pub fn now_kst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

fn krx_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).expect("valid open time")
}

fn krx_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).expect("valid close time")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolidayInfo {
    pub date: NaiveDate,
    pub year: i32,
    pub day_of_week: String,
    pub name: String,
}

/// Snapshot of a market's trading session.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSession {
    pub is_open: bool,
    pub next_open: Option<DateTime<FixedOffset>>,
    pub message: String,
}

/// KRX holiday set with durable storage and trading-day classification.
///
/// The holiday table is fetched per year from the exchange's open API,
/// persisted, and served from an in-memory set afterwards.
pub struct HolidayCalendar {
    pool: SqlitePool,
    http: reqwest::Client,
    holiday_url: String,
    holidays: RwLock<HashSet<NaiveDate>>,
}

impl HolidayCalendar {
    pub fn new(pool: SqlitePool, http: reqwest::Client, holiday_url: impl Into<String>) -> Self {
        Self {
            pool,
            http,
            holiday_url: holiday_url.into(),
            holidays: RwLock::new(HashSet::new()),
        }
    }

    /// Hydrate from storage and fetch missing years (current and next).
    /// Fetch failures are logged and tolerated: stale data still beats an
    /// empty calendar.
    pub async fn initialize(&self) -> Result<()> {
        self.reload_from_storage().await?;

        let current_year = now_kst().year();
        for year in [current_year, current_year + 1] {
            if !self.has_year(year).await? {
                info!(year, "no holiday data stored, fetching");
                if let Err(e) = self.update_holidays(year).await {
                    warn!(year, error = %e, "holiday fetch failed");
                }
            }
        }
        Ok(())
    }

    async fn reload_from_storage(&self) -> Result<()> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT date FROM krx_holidays")
            .fetch_all(&self.pool)
            .await?;
        let mut set = HashSet::new();
        for (raw,) in rows {
            if let Ok(d) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
                set.insert(d);
            }
        }
        info!(count = set.len(), "holiday calendar loaded");
        *self.holidays.write().await = set;
        Ok(())
    }

    async fn has_year(&self, year: i32) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM krx_holidays WHERE year = ?1")
                .bind(year)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Fetch one year's table from the upstream and persist it.
    pub async fn update_holidays(&self, year: i32) -> Result<usize> {
        let holidays = self.fetch_year(year).await?;

        for h in &holidays {
            sqlx::query(
                "INSERT INTO krx_holidays (date, year, day_of_week, name) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(date) DO UPDATE SET day_of_week = ?3, name = ?4",
            )
            .bind(h.date.format("%Y-%m-%d").to_string())
            .bind(h.year)
            .bind(&h.day_of_week)
            .bind(&h.name)
            .execute(&self.pool)
            .await?;
        }

        {
            let mut set = self.holidays.write().await;
            for h in &holidays {
                set.insert(h.date);
            }
        }

        info!(year, count = holidays.len(), "holiday table updated");
        Ok(holidays.len())
    }

    async fn fetch_year(&self, year: i32) -> Result<Vec<HolidayInfo>> {
        let response = self
            .http
            .get(&self.holiday_url)
            .query(&[("search_bas_yy", year.to_string())])
            .send()
            .await
            .map_err(|e| Error::Network(format!("holiday fetch: {e}")))?;

        let payload: HolidayResponse = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("holiday response decode: {e}")))?;

        let mut holidays = Vec::new();
        for row in payload.block1 {
            let Some(date) = parse_holiday_date(&row.calnd_dd) else {
                continue;
            };
            holidays.push(HolidayInfo {
                date,
                year: date.year(),
                day_of_week: row.kr_dy_tp,
                name: row.holdy_nm,
            });
        }
        Ok(holidays)
    }

    pub async fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.read().await.contains(&date)
    }

    /// A trading day is a weekday that is not a KRX holiday.
    pub async fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.is_holiday(date).await
    }

    pub async fn next_trading_day(&self, from: NaiveDate) -> NaiveDate {
        let holidays = self.holidays.read().await;
        let mut day = from + chrono::Duration::days(1);
        while is_weekend(day) || holidays.contains(&day) {
            day += chrono::Duration::days(1);
        }
        day
    }

    /// Session snapshot for a market at the given instant.
    pub async fn market_session_at(
        &self,
        market: Market,
        now: DateTime<FixedOffset>,
    ) -> MarketSession {
        match market {
            Market::Crypto => MarketSession {
                is_open: true,
                next_open: None,
                message: "crypto market is open 24/7".into(),
            },
            Market::Krx => self.krx_session(now).await,
        }
    }

    pub async fn market_session(&self, market: Market) -> MarketSession {
        self.market_session_at(market, now_kst()).await
    }

    pub async fn is_market_open(&self, market: Market) -> bool {
        self.market_session(market).await.is_open
    }

    async fn krx_session(&self, now: DateTime<FixedOffset>) -> MarketSession {
        let today = now.date_naive();
        let time = now.time();

        if !self.is_trading_day(today).await {
            let next = self.next_trading_day(today).await;
            return MarketSession {
                is_open: false,
                next_open: open_instant(next),
                message: if is_weekend(today) {
                    "market closed (weekend)".into()
                } else {
                    "market closed (holiday)".into()
                },
            };
        }

        if time < krx_open() {
            return MarketSession {
                is_open: false,
                next_open: open_instant(today),
                message: "market opens at 09:00 KST".into(),
            };
        }
        if time > krx_close() {
            let next = self.next_trading_day(today).await;
            return MarketSession {
                is_open: false,
                next_open: open_instant(next),
                message: "market closed (after hours)".into(),
            };
        }

        MarketSession {
            is_open: true,
            next_open: None,
            message: "market open, closes 15:30 KST".into(),
        }
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn open_instant(date: NaiveDate) -> Option<DateTime<FixedOffset>> {
    date.and_time(krx_open()).and_local_timezone(kst()).single()
}

/// Dates arrive as `YYYY-MM-DD` or `YYYYMMDD` depending on the endpoint.
fn parse_holiday_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
        .ok()
}

#[derive(Deserialize)]
struct HolidayResponse {
    #[serde(default)]
    block1: Vec<HolidayRow>,
}

#[derive(Deserialize)]
struct HolidayRow {
    calnd_dd: String,
    #[serde(default)]
    kr_dy_tp: String,
    #[serde(default)]
    holdy_nm: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn calendar_with(holidays: &[&str]) -> HolidayCalendar {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE krx_holidays (
                date TEXT PRIMARY KEY, year INTEGER, day_of_week TEXT, name TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let cal = HolidayCalendar::new(pool, reqwest::Client::new(), "http://unused");
        {
            let mut set = cal.holidays.write().await;
            for raw in holidays {
                set.insert(NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap());
            }
        }
        cal
    }

    fn kst_datetime(date: &str, time: &str) -> DateTime<FixedOffset> {
        let d = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        let t = NaiveTime::parse_from_str(time, "%H:%M").unwrap();
        d.and_time(t).and_local_timezone(kst()).single().unwrap()
    }

    #[tokio::test]
    async fn weekend_is_not_a_trading_day() {
        let cal = calendar_with(&[]).await;
        // 2026-08-01 is a Saturday
        let sat = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert!(!cal.is_trading_day(sat).await);
        let mon = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        assert!(cal.is_trading_day(mon).await);
    }

    #[tokio::test]
    async fn holiday_is_not_a_trading_day() {
        let cal = calendar_with(&["2026-08-03"]).await;
        let mon = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        assert!(!cal.is_trading_day(mon).await);
        // next trading day skips the holiday
        let fri = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        assert_eq!(
            cal.next_trading_day(fri).await,
            NaiveDate::from_ymd_opt(2026, 8, 4).unwrap()
        );
    }

    #[tokio::test]
    async fn krx_session_open_and_after_hours() {
        let cal = calendar_with(&[]).await;
        let open = cal
            .market_session_at(Market::Krx, kst_datetime("2026-08-04", "10:00"))
            .await;
        assert!(open.is_open);

        let evening = cal
            .market_session_at(Market::Krx, kst_datetime("2026-08-04", "18:00"))
            .await;
        assert!(!evening.is_open);
        let next = evening.next_open.unwrap();
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2026, 8, 5).unwrap());
    }

    #[tokio::test]
    async fn crypto_market_always_open() {
        let cal = calendar_with(&[]).await;
        let session = cal
            .market_session_at(Market::Crypto, kst_datetime("2026-08-01", "03:00"))
            .await;
        assert!(session.is_open);
    }

    #[test]
    fn holiday_date_formats() {
        assert!(parse_holiday_date("2026-01-01").is_some());
        assert!(parse_holiday_date("20260101").is_some());
        assert!(parse_holiday_date("not a date").is_none());
    }
}
