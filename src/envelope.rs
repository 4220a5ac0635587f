//! CloudEvents envelope handling.
//!
//! Messages travel as a payload plus a flat map of `ce-*` headers (binary
//! content mode). Inbound release events may also arrive in structured mode,
//! where the whole CloudEvent is a JSON document and the payload sits under
//! `data`. Both are normalised into [`Envelope`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const CE_SPECVERSION: &str = "ce-specversion";
pub const CE_TYPE: &str = "ce-type";
pub const CE_SOURCE: &str = "ce-source";
pub const CE_ID: &str = "ce-id";
pub const CE_TIME: &str = "ce-time";

pub const SPEC_VERSION: &str = "1.0";
pub const NEWS_TYPE: &str = "com.example.springnews";
pub const NEWS_SOURCE: &str = "spring.io/spring-news";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const CE_JSON_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Ordered string map of envelope headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> HeadersBuilder {
        HeadersBuilder::default()
    }

    /// The four headers carried by every outgoing news message.
    pub fn news(id: impl Into<String>) -> Self {
        Self::builder()
            .spec_version(SPEC_VERSION)
            .event_type(NEWS_TYPE)
            .source(NEWS_SOURCE)
            .id(id)
            .build()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Fluent construction of [`Headers`].
#[derive(Debug, Default)]
pub struct HeadersBuilder {
    headers: Headers,
}

impl HeadersBuilder {
    pub fn spec_version(self, value: impl Into<String>) -> Self {
        self.header(CE_SPECVERSION, value)
    }

    pub fn event_type(self, value: impl Into<String>) -> Self {
        self.header(CE_TYPE, value)
    }

    pub fn source(self, value: impl Into<String>) -> Self {
        self.header(CE_SOURCE, value)
    }

    pub fn id(self, value: impl Into<String>) -> Self {
        self.header(CE_ID, value)
    }

    pub fn time(self, value: impl Into<String>) -> Self {
        self.header(CE_TIME, value)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn build(self) -> Headers {
        self.headers
    }
}

/// A payload together with its envelope headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub payload: T,
    pub headers: Headers,
}

impl<T> Envelope<T> {
    pub fn new(payload: T, headers: Headers) -> Self {
        Self { payload, headers }
    }

    /// The `ce-id` header, if present and non-empty.
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CE_ID).filter(|id| !id.is_empty())
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decode a message body.
    ///
    /// A `content_type` of `application/cloudevents+json` selects structured
    /// mode; anything else (including none) is treated as binary mode with the
    /// payload as plain JSON and the attributes in `headers`.
    pub fn decode(content_type: Option<&str>, headers: Headers, body: &[u8]) -> Result<Self, Error> {
        if content_type.is_some_and(is_structured) {
            return decode_structured(headers, body);
        }
        let payload = serde_json::from_slice(body)?;
        Ok(Self::new(payload, headers))
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize the payload as the JSON message body.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}

fn is_structured(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(CE_JSON_CONTENT_TYPE))
}

#[derive(Deserialize)]
struct StructuredEvent {
    specversion: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    source: Option<String>,
    id: Option<String>,
    time: Option<String>,
    data: Option<serde_json::Value>,
}

fn decode_structured<T: DeserializeOwned>(mut headers: Headers, body: &[u8]) -> Result<Envelope<T>, Error> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
    let event: StructuredEvent = serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| Error::MalformedEnvelope(e.to_string()))?;

    let id = event
        .id
        .filter(|id| !id.is_empty())
        .ok_or(Error::MissingCorrelationId)?;
    let data = event
        .data
        .ok_or_else(|| Error::MalformedEnvelope("structured event has no data".to_string()))?;

    let attributes = [
        (CE_SPECVERSION, event.specversion),
        (CE_TYPE, event.event_type),
        (CE_SOURCE, event.source),
        (CE_TIME, event.time),
    ];
    for (key, value) in attributes {
        if let Some(value) = value {
            headers.insert(key, value);
        }
    }
    headers.insert(CE_ID, id);

    let payload = serde_json::from_value(data)?;
    Ok(Envelope::new(payload, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn news_headers_are_exactly_the_four_keys() {
        let headers = Headers::news("abc-123");
        assert_eq!(headers.len(), 4);
        assert_eq!(headers.get(CE_SPECVERSION), Some("1.0"));
        assert_eq!(headers.get(CE_TYPE), Some("com.example.springnews"));
        assert_eq!(headers.get(CE_SOURCE), Some("spring.io/spring-news"));
        assert_eq!(headers.get(CE_ID), Some("abc-123"));
    }

    #[test]
    fn empty_correlation_id_counts_as_missing() {
        let lope = Envelope::new((), Headers::builder().id("").build());
        assert_eq!(lope.correlation_id(), None);
    }

    #[test]
    fn binary_mode_keeps_transport_headers() {
        let headers = Headers::builder().id("x-1").header("traceparent", "00-abc").build();
        let lope: Envelope<Ping> = Envelope::decode(None, headers, br#"{"n":7}"#).unwrap();
        assert_eq!(lope.payload, Ping { n: 7 });
        assert_eq!(lope.correlation_id(), Some("x-1"));
        assert_eq!(lope.headers.get("traceparent"), Some("00-abc"));
    }

    #[test]
    fn binary_mode_rejects_bad_json() {
        let err = Envelope::<Ping>::decode(Some(JSON_CONTENT_TYPE), Headers::new(), b"{n:").unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }

    #[test]
    fn structured_mode_lifts_attributes_into_headers() {
        let body = json!({
            "specversion": "1.0",
            "type": "com.example.springevent",
            "source": "spring.io/releases",
            "id": "evt-9",
            "time": "2023-11-16T09:00:00Z",
            "data": { "n": 3 }
        });
        let lope: Envelope<Ping> = Envelope::decode(
            Some("Application/CloudEvents+JSON; charset=utf-8"),
            Headers::builder().id("ignored").build(),
            body.to_string().as_bytes(),
        )
        .unwrap();

        assert_eq!(lope.payload, Ping { n: 3 });
        assert_eq!(lope.correlation_id(), Some("evt-9"));
        assert_eq!(lope.headers.get(CE_TYPE), Some("com.example.springevent"));
        assert_eq!(lope.headers.get(CE_TIME), Some("2023-11-16T09:00:00Z"));
    }

    #[test]
    fn structured_mode_without_id_is_missing_correlation() {
        let body = json!({ "specversion": "1.0", "data": { "n": 1 } });
        let err = Envelope::<Ping>::decode(Some(CE_JSON_CONTENT_TYPE), Headers::new(), body.to_string().as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::MissingCorrelationId));
    }

    #[test]
    fn structured_mode_rejects_positional_arrays() {
        let body = json!(["1.0", "t", "s", "arr-1", null, { "n": 1 }]);
        let err = Envelope::<Ping>::decode(Some(CE_JSON_CONTENT_TYPE), Headers::new(), body.to_string().as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn structured_mode_needs_an_object_with_data() {
        let err = Envelope::<Ping>::decode(Some(CE_JSON_CONTENT_TYPE), Headers::new(), b"[1,2]").unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));

        let body = json!({ "id": "e1" });
        let err = Envelope::<Ping>::decode(Some(CE_JSON_CONTENT_TYPE), Headers::new(), body.to_string().as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }
}
