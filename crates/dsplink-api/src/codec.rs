//! Record codec for the device's JSON-per-line protocol.
//!
//! Requests go out as one JSON object followed by the record terminator.
//! Inbound bytes are accumulated and split on the terminator; each complete
//! record decodes into an [`Inbound`] value. Read boundaries carry no
//! meaning: one read may hold several records, and one record may span
//! several reads.
//!
//! Undecodable records surface as [`Inbound::Malformed`] rather than as a
//! stream error, so one bad record never tears the connection down.

use std::io;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::types::{Method, ParamRef, ParamValue, SampleSource, Sample, ValueFormat};

/// Default record terminator (newline only, no carriage return).
pub const DEFAULT_TERMINATOR: &[u8] = b"\n";

/// Upper bound on a single buffered record.
pub const DEFAULT_MAX_RECORD_LEN: usize = 64 * 1024;

/// Request id reserved for unsolicited notifications.
pub const NOTIFICATION_ID: u64 = 0;

/// Raw bytes echoed into diagnostics are cut to this many characters.
const RAW_PREVIEW_LEN: usize = 256;

// ── Outbound ─────────────────────────────────────────────────────────

/// One outbound request, serialized as
/// `{"id":N,"method":M,"params":{"param":P,"val":V,"fmt":F}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    pub params: RequestParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestParams {
    pub param: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val: Option<ParamValue>,
    #[serde(rename = "fmt", skip_serializing_if = "Option::is_none")]
    pub format: Option<ValueFormat>,
}

impl Request {
    pub fn get(id: u64, param: &ParamRef) -> Self {
        Self::build(id, Method::Get, param.wire_name(), None, None)
    }

    pub fn set(id: u64, param: &ParamRef, value: ParamValue) -> Self {
        Self::build(id, Method::Set, param.wire_name(), Some(value), None)
    }

    pub fn subscribe(id: u64, param: &ParamRef, format: ValueFormat) -> Self {
        Self::build(id, Method::Subscribe, param.wire_name(), None, Some(format))
    }

    pub fn unsubscribe(id: u64, param: &ParamRef, format: ValueFormat) -> Self {
        Self::build(id, Method::Unsubscribe, param.wire_name(), None, Some(format))
    }

    pub(crate) fn auth(id: u64, password: &str) -> Self {
        Self::build(
            id,
            Method::Auth,
            "password".into(),
            Some(ParamValue::from(password)),
            None,
        )
    }

    fn build(
        id: u64,
        method: Method,
        param: String,
        val: Option<ParamValue>,
        format: Option<ValueFormat>,
    ) -> Self {
        Self {
            id,
            method,
            params: RequestParams { param, val, format },
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

/// One decoded inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to a request, correlated by id.
    Response(Response),
    /// Unsolicited parameter update or meter reading.
    Notification(Notification),
    /// A record that could not be decoded; already consumed from the buffer.
    Malformed(Malformed),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    /// `Ok(result)` or `Err(error text from the device)`.
    pub outcome: Result<ParamValue, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub param: ParamRef,
    pub value: ParamValue,
    pub format: Option<ValueFormat>,
    pub peak: Option<f64>,
    pub clip: Option<bool>,
}

impl Notification {
    pub fn into_sample(self, source: SampleSource) -> Sample {
        Sample {
            param: self.param,
            value: self.value,
            format: self.format,
            peak: self.peak,
            clip: self.clip,
            source,
            received_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Malformed {
    /// Lossy UTF-8 preview of the offending bytes.
    pub raw: String,
    pub reason: String,
    /// Request id, when the record was recognisably a response.
    pub id: Option<u64>,
}

impl Malformed {
    fn new(raw: &[u8], reason: impl Into<String>) -> Self {
        let mut preview = String::from_utf8_lossy(raw).into_owned();
        if preview.chars().count() > RAW_PREVIEW_LEN {
            preview = preview.chars().take(RAW_PREVIEW_LEN).collect();
            preview.push('…');
        }
        Self {
            raw: preview,
            reason: reason.into(),
            id: None,
        }
    }

    fn for_request(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The record as an error, for failing the request it answered.
    pub fn to_error(&self) -> Error {
        Error::Protocol {
            message: self.reason.clone(),
            raw: self.raw.clone(),
        }
    }
}

/// Decode one complete record (terminator already removed).
pub fn decode_record(record: &[u8]) -> Inbound {
    let body = trim_record(record);

    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return Inbound::Malformed(Malformed::new(body, e.to_string())),
    };
    let Value::Object(map) = value else {
        return Inbound::Malformed(Malformed::new(body, "record is not a JSON object"));
    };

    let id = match map.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => match raw.as_u64() {
            Some(id) => Some(id),
            None => {
                return Inbound::Malformed(Malformed::new(body, "id is not a non-negative integer"));
            }
        },
    };

    match id {
        Some(id) if id != NOTIFICATION_ID => decode_response(id, &map, body),
        _ => decode_notification(&map, body),
    }
}

fn decode_response(id: u64, map: &Map<String, Value>, raw: &[u8]) -> Inbound {
    if let Some(error) = map.get("error") {
        let message = error
            .as_str()
            .map_or_else(|| error.to_string(), str::to_owned);
        return Inbound::Response(Response {
            id,
            outcome: Err(message),
        });
    }

    match map.get("result") {
        Some(result) => Inbound::Response(Response {
            id,
            outcome: Ok(ParamValue::from(result.clone())),
        }),
        None => Inbound::Malformed(Malformed::new(raw, "response carries neither result nor error").for_request(id)),
    }
}

/// Notifications come either wrapped (`{"params":{...}}`) or flat
/// (`{"param":...,"val":...}`); both shapes decode the same way.
fn decode_notification(map: &Map<String, Value>, raw: &[u8]) -> Inbound {
    let body = map.get("params").and_then(Value::as_object).unwrap_or(map);

    let Some(name) = body.get("param").and_then(Value::as_str) else {
        return Inbound::Malformed(Malformed::new(raw, "notification without param name"));
    };
    let param = match name.parse::<ParamRef>() {
        Ok(p) => p,
        Err(e) => return Inbound::Malformed(Malformed::new(raw, e.to_string())),
    };
    let Some(value) = body.get("val") else {
        return Inbound::Malformed(Malformed::new(raw, "notification without val"));
    };

    let format = body
        .get("fmt")
        .and_then(Value::as_str)
        .and_then(|f| f.parse::<ValueFormat>().ok());

    Inbound::Notification(Notification {
        param,
        value: ParamValue::from(value.clone()),
        format,
        peak: body.get("peak").and_then(Value::as_f64),
        clip: body.get("clip").and_then(Value::as_bool),
    })
}

/// Strip a trailing carriage return and surrounding ASCII whitespace.
fn trim_record(record: &[u8]) -> &[u8] {
    record.trim_ascii()
}

// ── RecordCodec ──────────────────────────────────────────────────────

/// Terminator-framed JSON codec used by both channels.
///
/// The terminator is configurable: devices have been observed sending
/// `\n` where documentation promised `\r\n`. With the default `\n`
/// terminator a stray `\r` before it is stripped during decoding.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    terminator: Vec<u8>,
    max_record_len: usize,
    /// Offset up to which the buffer has already been scanned.
    scanned: usize,
    /// Set while skipping the tail of an oversized record.
    discarding: bool,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATOR, DEFAULT_MAX_RECORD_LEN)
    }
}

impl RecordCodec {
    /// An empty terminator falls back to [`DEFAULT_TERMINATOR`].
    pub fn new(terminator: &[u8], max_record_len: usize) -> Self {
        let terminator = if terminator.is_empty() {
            DEFAULT_TERMINATOR.to_vec()
        } else {
            terminator.to_vec()
        };
        Self {
            terminator,
            max_record_len: max_record_len.max(1),
            scanned: 0,
            discarding: false,
        }
    }

    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    /// Decode every record in a self-contained datagram.
    ///
    /// Unlike a stream, a datagram's final record needs no terminator.
    pub fn decode_datagram(&self, datagram: &[u8]) -> Vec<Inbound> {
        let mut codec = Self::new(&self.terminator, self.max_record_len.max(datagram.len()));
        let mut buf = BytesMut::from(datagram);
        let mut records = Vec::new();

        while let Ok(Some(inbound)) = codec.decode(&mut buf) {
            records.push(inbound);
        }
        if !trim_record(&buf).is_empty() {
            records.push(decode_record(&buf));
        }
        records
    }

    fn find_terminator(&self, haystack: &[u8]) -> Option<usize> {
        haystack
            .windows(self.terminator.len())
            .position(|w| w == self.terminator.as_slice())
    }
}

impl Decoder for RecordCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        let term_len = self.terminator.len();

        loop {
            let start = self.scanned.min(buf.len());
            let Some(offset) = self.find_terminator(&buf[start..]) else {
                if buf.len() > self.max_record_len {
                    // Keep only what could be the start of a split terminator.
                    let keep = term_len - 1;
                    let dropped = buf.split_to(buf.len().saturating_sub(keep));
                    self.scanned = 0;
                    if self.discarding {
                        return Ok(None);
                    }
                    self.discarding = true;
                    return Ok(Some(Inbound::Malformed(Malformed::new(
                        &dropped,
                        format!("record exceeds {} bytes without terminator", self.max_record_len),
                    ))));
                }
                // Resume where a partially received terminator could begin.
                self.scanned = buf.len().saturating_sub(term_len - 1);
                return Ok(None);
            };

            let end = start + offset;
            let record = buf.split_to(end + term_len);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let body = &record[..end];
            if trim_record(body).is_empty() {
                continue;
            }
            if body.len() > self.max_record_len {
                return Ok(Some(Inbound::Malformed(Malformed::new(
                    body,
                    format!("record exceeds {} bytes", self.max_record_len),
                ))));
            }
            return Ok(Some(decode_record(body)));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        if let Some(inbound) = self.decode(buf)? {
            return Ok(Some(inbound));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let fragment = buf.split();
        self.scanned = 0;
        if self.discarding || trim_record(&fragment).is_empty() {
            self.discarding = false;
            return Ok(None);
        }
        Ok(Some(Inbound::Malformed(Malformed::new(
            &fragment,
            "stream ended inside a record",
        ))))
    }
}

impl Encoder<Request> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, request: Request, buf: &mut BytesMut) -> Result<(), io::Error> {
        serde_json::to_writer(buf.writer(), &request).map_err(io::Error::other)?;
        buf.extend_from_slice(&self.terminator);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
