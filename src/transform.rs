use anyhow::Result;
use async_trait::async_trait;
use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::de::DeserializeOwned;
use std::borrow::Cow;

use crate::envelope::{Envelope, Headers, JSON_CONTENT_TYPE};
use crate::error::Error;
use crate::news::{ReleaseEvent, announce};

#[derive(Debug)]
pub struct Message<'a> {
    pub data: Cow<'a, [u8]>,
    pub properties: BasicProperties,
}

impl<'a> Message<'a> {
    pub fn new(data: impl Into<Cow<'a, [u8]>>, properties: BasicProperties) -> Self {
        Self {
            data: data.into(),
            properties,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type().as_ref().map(ShortString::as_str)
    }

    /// String-valued AMQP headers. Values of other AMQP types are skipped.
    pub fn headers(&self) -> Headers {
        self.properties
            .headers()
            .as_ref()
            .map(headers_from_field_table)
            .unwrap_or_default()
    }

    /// Decode the body into an [`Envelope`] using the message's content type
    /// and headers.
    ///
    /// # Errors
    /// Returns an [`Error`] if the body or its envelope is malformed.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Envelope<T>, Error> {
        Envelope::decode(self.content_type(), self.headers(), &self.data)
    }
}

pub fn headers_from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

pub fn field_table_from_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        table.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
    table
}

#[async_trait]
pub trait MessageTransformer: Send + Sync {
    /// Transform an incoming AMQP `Message` into a new `Message` before publish.
    ///
    /// # Errors
    /// Implementations may return an error when transformation fails, e.g.
    /// invalid payloads, schema violations, or other application-specific
    /// conditions that prevent producing an output message.
    async fn transform<'a>(&self, input: Message<'a>) -> Result<Message<'a>>;
}

/// Turns release events into news messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnouncementTransformer;

#[async_trait]
impl MessageTransformer for AnnouncementTransformer {
    async fn transform<'a>(&self, input: Message<'a>) -> Result<Message<'a>> {
        let event = input.decode::<ReleaseEvent>()?;
        let news = announce(event)?;
        let data = news.encode()?;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_headers(field_table_from_headers(&news.headers));
        if let Some(id) = news.correlation_id() {
            properties = properties.with_message_id(ShortString::from(id));
        }

        Ok(Message::new(data, properties))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CE_ID, CE_JSON_CONTENT_TYPE};
    use crate::news::NewsItem;
    use serde_json::json;

    fn amqp_headers(pairs: &[(&str, &str)]) -> FieldTable {
        let mut table = FieldTable::default();
        for (k, v) in pairs {
            table.insert(ShortString::from(*k), AMQPValue::LongString(LongString::from(*v)));
        }
        table
    }

    fn release_body() -> Vec<u8> {
        json!({
            "releaseName": "Spring Framework",
            "version": "6.1",
            "releaseDate": "2023-11-16"
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn field_table_round_trip_keeps_strings_only() {
        let mut table = amqp_headers(&[("ce-id", "abc")]);
        table.insert(ShortString::from("ce-short"), AMQPValue::ShortString(ShortString::from("s")));
        table.insert(ShortString::from("x-retries"), AMQPValue::LongInt(3));

        let headers = headers_from_field_table(&table);
        assert_eq!(headers.get("ce-id"), Some("abc"));
        assert_eq!(headers.get("ce-short"), Some("s"));
        assert!(!headers.contains_key("x-retries"));

        let back = headers_from_field_table(&field_table_from_headers(&headers));
        assert_eq!(back, headers);
    }

    #[tokio::test]
    async fn binary_release_becomes_news() {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_headers(amqp_headers(&[(CE_ID, "abc-123")]));
        let input = Message::new(release_body(), properties);

        let output = AnnouncementTransformer.transform(input).await.unwrap();

        assert_eq!(output.content_type(), Some(JSON_CONTENT_TYPE));
        assert_eq!(
            output.properties.message_id().as_ref().map(ShortString::as_str),
            Some("abc-123")
        );
        assert_eq!(output.headers(), Headers::news("abc-123"));

        let news: Envelope<NewsItem> = output.decode().unwrap();
        assert_eq!(news.payload.headline, "Spring Framework 6.1 Released");
        assert_eq!(
            news.payload.copy,
            "Spring Framework version 6.1 was released on November 16, 2023"
        );
    }

    #[tokio::test]
    async fn structured_release_becomes_news() {
        let body = json!({
            "specversion": "1.0",
            "type": "com.example.springevent",
            "source": "spring.io/releases",
            "id": "evt-42",
            "data": {
                "releaseName": "Spring Boot",
                "version": "3.2.0",
                "releaseDate": "2023-11-23"
            }
        });
        let properties =
            BasicProperties::default().with_content_type(ShortString::from(CE_JSON_CONTENT_TYPE));
        let input = Message::new(body.to_string().into_bytes(), properties);

        let output = AnnouncementTransformer.transform(input).await.unwrap();
        assert_eq!(output.headers(), Headers::news("evt-42"));

        let news: Envelope<NewsItem> = output.decode().unwrap();
        assert_eq!(news.payload.headline, "Spring Boot 3.2.0 Released");
    }

    #[tokio::test]
    async fn missing_correlation_is_malformed_input() {
        let input = Message::new(release_body(), BasicProperties::default());
        let err = AnnouncementTransformer.transform(input).await.unwrap_err();
        assert!(Error::is_malformed_input(&err));
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MissingCorrelationId)));
    }

    #[tokio::test]
    async fn bad_payload_is_malformed_input() {
        let properties = BasicProperties::default().with_headers(amqp_headers(&[(CE_ID, "x")]));
        let input = Message::new(&b"not json"[..], properties);
        let err = AnnouncementTransformer.transform(input).await.unwrap_err();
        assert!(Error::is_malformed_input(&err));
    }
}
