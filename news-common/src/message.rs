use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of reasons an inbound message can be rejected.
/// All of these are permanent: redelivering the same bytes cannot fix them.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message is missing required field: {0}")]
    MissingField(&'static str),
    #[error("message has no usable text content")]
    EmptyContent,
    #[error("could not parse {field} as an RFC 3339 timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
}

/// The shape the feed fetcher publishes, before validation.
/// Everything is optional here so that we can produce a precise
/// `MessageError` instead of a generic serde failure.
#[derive(Debug, Default, Deserialize)]
struct WireItem {
    source: Option<String>,
    title: Option<String>,
    description: Option<String>,
    link: Option<String>,
    published_date: Option<String>,
    category: Option<String>,
    picture: Option<String>,
    provider: Option<String>,
}

/// One raw article, validated and ready for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawItem {
    pub source: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub published_date: DateTime<Utc>,
    /// Category assigned by the upstream feed, if any. Preserved as
    /// `original_category` on the stored record; the pipeline always
    /// assigns its own.
    pub category: Option<String>,
    pub picture: Option<String>,
    pub provider: Option<String>,
}

impl RawItem {
    /// Parse and validate one message body.
    pub fn from_bytes(bytes: &[u8]) -> Result<RawItem, MessageError> {
        let wire: WireItem = serde_json::from_slice(bytes)?;

        let link = match wire.link {
            Some(link) if !link.trim().is_empty() => link,
            _ => return Err(MessageError::MissingField("link")),
        };
        let source = match wire.source {
            Some(source) if !source.trim().is_empty() => source,
            _ => return Err(MessageError::MissingField("source")),
        };

        let title = wire.title.unwrap_or_default();
        let description = wire.description.unwrap_or_default();
        if title.trim().is_empty() && description.trim().is_empty() {
            return Err(MessageError::EmptyContent);
        }

        let raw_date = wire
            .published_date
            .ok_or(MessageError::MissingField("published_date"))?;
        let published_date = DateTime::parse_from_rfc3339(&raw_date)
            .map_err(|_| MessageError::InvalidTimestamp {
                field: "published_date",
                value: raw_date,
            })?
            .with_timezone(&Utc);

        Ok(RawItem {
            source,
            title,
            description,
            link,
            published_date,
            category: wire.category,
            picture: wire.picture,
            provider: wire.provider,
        })
    }

    /// The text fed to fingerprinting and classification.
    pub fn text(&self) -> String {
        format!("{} {}", self.title, self.description)
            .trim()
            .to_owned()
    }
}
