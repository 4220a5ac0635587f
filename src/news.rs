use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::envelope::{Envelope, Headers};
use crate::error::Error;

/// Acknowledgment returned by [`log_news`].
pub const ACK: &str = "OK";

/// A software release announced by an upstream publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEvent {
    pub release_name: String,
    pub version: String,
    #[serde(with = "release_date")]
    pub release_date: NaiveDate,
}

/// The announcement derived from a [`ReleaseEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub when: DateTime<Utc>,
    pub headline: String,
    pub copy: String,
}

impl NewsItem {
    pub fn for_release(event: &ReleaseEvent, when: DateTime<Utc>) -> Self {
        Self {
            when,
            headline: format!("{} {} Released", event.release_name, event.version),
            copy: format!(
                "{} version {} was released on {}",
                event.release_name,
                event.version,
                long_date(event.release_date)
            ),
        }
    }
}

/// en-US long form, e.g. "November 16, 2023".
pub fn long_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

/// Build the news announcement for a release event.
///
/// The outbound headers carry the inbound `ce-id` so the news message can be
/// traced back to the event that caused it.
///
/// # Errors
/// Returns [`Error::MissingCorrelationId`] if the inbound envelope has no
/// `ce-id`. Nothing is logged in that case.
pub fn announce(input: Envelope<ReleaseEvent>) -> Result<Envelope<NewsItem>, Error> {
    announce_at(input, Utc::now())
}

/// [`announce`] with an explicit `when`.
pub fn announce_at(
    input: Envelope<ReleaseEvent>,
    when: DateTime<Utc>,
) -> Result<Envelope<NewsItem>, Error> {
    let id = input
        .correlation_id()
        .ok_or(Error::MissingCorrelationId)?
        .to_owned();
    let release = &input.payload;

    info!(
        event = "release_received",
        ce_id = %id,
        release_name = %release.release_name,
        version = %release.version,
        release_date = %release.release_date,
        "Release event received"
    );

    let news = NewsItem::for_release(release, when);
    Ok(Envelope::new(news, Headers::news(id)))
}

/// Record a news message and acknowledge it.
pub fn log_news(input: &Envelope<NewsItem>) -> &'static str {
    let news = &input.payload;
    info!(
        event = "news_received",
        ce_id = input.correlation_id().unwrap_or_default(),
        when = %news.when.to_rfc3339(),
        headline = %news.headline,
        copy = %news.copy,
        "News received"
    );
    ACK
}

/// Accepts `YYYY-MM-DD`, an RFC 3339 timestamp, or epoch milliseconds.
mod release_date {
    use chrono::{DateTime, NaiveDate, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        EpochMillis(i64),
    }

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&date.format("%Y-%m-%d"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .ok()
                .or_else(|| {
                    DateTime::parse_from_rfc3339(&text)
                        .ok()
                        .map(|dt| dt.date_naive())
                })
                .ok_or_else(|| D::Error::custom(format!("unrecognised release date '{text}'"))),
            Raw::EpochMillis(millis) => DateTime::<Utc>::from_timestamp_millis(millis)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| D::Error::custom(format!("release date out of range: {millis}"))),
        }
    }
}
