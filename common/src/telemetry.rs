use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::{Map, Number, Value};

use crate::{
    config::TelemetryConfig,
    error::{FetchError, PublishError, TransportError},
    types::{Ack, ChannelUpdate, Field, FieldValue},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpTransport {
    fn post_json(
        &mut self,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;

    fn get(&mut self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

pub trait Telemetry {
    fn publish(&mut self, update: &ChannelUpdate) -> Result<Ack, PublishError>;

    /// `Ok(None)` when the channel holds no value for `field`.
    fn fetch(&mut self, field: Field) -> Result<Option<FieldValue>, FetchError>;
}

pub struct ThingSpeakClient<H> {
    transport: H,
    base_url: String,
    channel_id: u64,
    write_api_key: String,
    read_api_key: String,
    timeout: Duration,
}

impl<H: HttpTransport> ThingSpeakClient<H> {
    pub fn new(config: &TelemetryConfig, transport: H) -> Self {
        Self {
            transport,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            channel_id: config.channel_id,
            write_api_key: config.write_api_key.clone(),
            read_api_key: config.read_api_key.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn transport(&self) -> &H {
        &self.transport
    }

    pub fn update_url(&self) -> String {
        format!("{}/update", self.base_url)
    }

    pub fn last_value_url(&self, field: Field) -> String {
        format!(
            "{}/channels/{}/fields/{}/last.json?api_key={}",
            self.base_url,
            self.channel_id,
            field.index(),
            self.read_api_key
        )
    }

    pub fn update_body(&self, update: &ChannelUpdate) -> Vec<u8> {
        let mut body = Map::new();
        body.insert(
            "api_key".to_string(),
            Value::String(self.write_api_key.clone()),
        );
        for (field, value) in update.iter() {
            let number = Number::from_f64(f64::from(value)).map_or(Value::Null, Value::Number);
            body.insert(field.key(), number);
        }
        Value::Object(body).to_string().into_bytes()
    }
}

impl<H: HttpTransport> Telemetry for ThingSpeakClient<H> {
    fn publish(&mut self, update: &ChannelUpdate) -> Result<Ack, PublishError> {
        if update.is_empty() {
            return Err(PublishError::Empty);
        }

        let url = self.update_url();
        let body = self.update_body(update);
        let response = self
            .transport
            .post_json(&url, &body, self.timeout)
            .map_err(PublishError::Transport)?;

        if !response.is_success() {
            return Err(PublishError::Status(response.status));
        }

        let ack = parse_update_ack(&response.body)?;
        debug!("update stored as entry {}", ack.entry_id);
        Ok(ack)
    }

    fn fetch(&mut self, field: Field) -> Result<Option<FieldValue>, FetchError> {
        let url = self.last_value_url(field);
        let response = self.transport.get(&url, self.timeout)?;

        if !response.is_success() {
            return Err(FetchError::Status(response.status));
        }

        parse_last_value(field, &response.body)
    }
}

/// The service answers an update with the new entry id, or `0` when it refused
/// the write (most often the per-channel rate limit).
pub fn parse_update_ack(body: &[u8]) -> Result<Ack, PublishError> {
    let text = String::from_utf8_lossy(body);
    let entry_id = text
        .trim()
        .parse::<u64>()
        .map_err(|_| PublishError::Malformed(text.trim().to_string()))?;

    if entry_id == 0 {
        return Err(PublishError::Rejected);
    }
    Ok(Ack { entry_id })
}

pub fn parse_last_value(field: Field, body: &[u8]) -> Result<Option<FieldValue>, FetchError> {
    let document: Value =
        serde_json::from_slice(body).map_err(|err| FetchError::Malformed(err.to_string()))?;

    let entry = match document {
        // Answer for a channel without entries.
        Value::Number(n) if n.as_i64() == Some(-1) => return Ok(None),
        Value::Object(entry) => entry,
        other => {
            return Err(FetchError::Malformed(format!(
                "expected object, got {other}"
            )))
        }
    };

    let value = match entry.get(&field.key()) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(raw)) if raw.trim().is_empty() => return Ok(None),
        Some(Value::String(raw)) => raw
            .trim()
            .parse::<f32>()
            .map_err(|_| FetchError::Malformed(format!("{field} is not numeric: `{raw}`")))?,
        Some(Value::Number(n)) => n
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| FetchError::Malformed(format!("{field} is not numeric")))?,
        Some(other) => {
            return Err(FetchError::Malformed(format!(
                "{field} has unexpected type: {other}"
            )))
        }
    };

    if !value.is_finite() {
        return Err(FetchError::Malformed(format!("{field} is not finite")));
    }

    Ok(Some(FieldValue {
        value,
        entry_id: entry.get("entry_id").and_then(Value::as_u64),
        created_at: entry
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc)),
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Request {
        pub method: &'static str,
        pub url: String,
        pub body: Vec<u8>,
        pub timeout: Duration,
    }

    /// Replays canned responses in order; answers 200 "1" once they run out.
    #[derive(Debug, Default)]
    pub struct FakeTransport {
        pub requests: Vec<Request>,
        pub responses: VecDeque<Result<HttpResponse, TransportError>>,
    }

    impl FakeTransport {
        pub fn reply(mut self, status: u16, body: &str) -> Self {
            self.responses.push_back(Ok(HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            }));
            self
        }

        pub fn fail(mut self, err: TransportError) -> Self {
            self.responses.push_back(Err(err));
            self
        }

        fn next(&mut self) -> Result<HttpResponse, TransportError> {
            self.responses.pop_front().unwrap_or_else(|| {
                Ok(HttpResponse {
                    status: 200,
                    body: b"1".to_vec(),
                })
            })
        }
    }

    impl HttpTransport for FakeTransport {
        fn post_json(
            &mut self,
            url: &str,
            body: &[u8],
            timeout: Duration,
        ) -> Result<HttpResponse, TransportError> {
            self.requests.push(Request {
                method: "POST",
                url: url.to_string(),
                body: body.to_vec(),
                timeout,
            });
            self.next()
        }

        fn get(&mut self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
            self.requests.push(Request {
                method: "GET",
                url: url.to_string(),
                body: Vec::new(),
                timeout,
            });
            self.next()
        }
    }
}
