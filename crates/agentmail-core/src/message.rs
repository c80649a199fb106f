use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::MailError;

/// Largest per-second sequence number an id can carry.
pub const MAX_SEQUENCE: u32 = 9999;

const ID_LEN: usize = 20;
const MAX_NAME_LEN: usize = 128;

/// A single immutable mail message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(with = "rfc3339")]
    pub time: OffsetDateTime,
    pub body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl Message {
    /// A message with no id yet; the store assigns one on save.
    pub fn new(from: impl Into<String>, to: impl Into<String>, body: Body) -> Self {
        Self {
            id: String::new(),
            from: from.into(),
            to: to.into(),
            time: OffsetDateTime::now_utc(),
            body,
            reply_to: None,
            priority: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_priority(mut self, priority: Option<String>) -> Self {
        self.priority = priority.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn mailbox(&self) -> Result<Mailbox, MailError> {
        Mailbox::parse(&self.to)
    }
}

/// Message payload: free text or a structured JSON value.
///
/// Serialized untagged, so a JSON string always reads back as `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Text(String),
    Structured(serde_json::Value),
}

impl Body {
    /// Structured when `raw` parses as a non-string JSON value, text otherwise.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) if !value.is_string() => Self::Structured(value),
            _ => Self::Text(raw.to_owned()),
        }
    }

    /// Wire-level value; a JSON string value becomes `Text`.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::Text(s),
            other => Self::Structured(other),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Structured(v) => v.clone(),
        }
    }

    /// Size counted against the store's body ceiling.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Structured(v) => serde_json::to_vec(v).map(|b| b.len()).unwrap_or(usize::MAX),
        }
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Structured(v) => write!(f, "{v}"),
        }
    }
}

/// Where a message lives: a broadcast topic or an agent's DM inbox.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mailbox {
    Topic(String),
    Dm(String),
}

impl Mailbox {
    /// Parses a `to` address: `@name` is a DM, anything else a topic.
    pub fn parse(address: &str) -> Result<Self, MailError> {
        let address = address.trim();
        let (name, dm) = match address.strip_prefix('@') {
            Some(rest) => (rest, true),
            None => (address, false),
        };

        validate_name(name).map_err(|reason| MailError::InvalidAddress {
            address: address.to_owned(),
            reason,
        })?;

        Ok(if dm {
            Self::Dm(name.to_owned())
        } else {
            Self::Topic(name.to_owned())
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Topic(n) | Self::Dm(n) => n,
        }
    }

    pub fn is_dm(&self) -> bool {
        matches!(self, Self::Dm(_))
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(n) => f.write_str(n),
            Self::Dm(n) => write!(f, "@{n}"),
        }
    }
}

/// Agent and topic names double as directory names.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name is too long");
    }
    if name.starts_with('.') {
        return Err("name may not start with '.'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("name may only contain letters, digits, '-', '_' and '.'");
    }
    Ok(())
}

/// Highest per-second starting sequence a generator may pick. The rest of
/// the range is left for the ids a busy second hands out after it.
pub const MAX_SEQUENCE_START: u32 = 5000;

/// Monotonic `YYYYMMDD-HHMMSS-NNNN` id source.
///
/// Ids never go backwards even if the wall clock does. When a second runs
/// out of sequence numbers the generator moves on to the next second.
///
/// Every second starts counting at a per-generator offset so independent
/// processes writing in the same second rarely hand out the same id.
#[derive(Debug)]
pub struct IdGenerator {
    start: u32,
    last_secs: i64,
    seq: u32,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::with_start(random_start())
    }
}

impl IdGenerator {
    /// A generator whose seconds begin at `start` (clamped to
    /// `1..=MAX_SEQUENCE_START`).
    pub fn with_start(start: u32) -> Self {
        Self {
            start: start.clamp(1, MAX_SEQUENCE_START),
            last_secs: 0,
            seq: 0,
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn next(&mut self, now: OffsetDateTime) -> String {
        let secs = now.unix_timestamp();
        if secs > self.last_secs {
            self.last_secs = secs;
            self.seq = self.start;
        } else {
            self.seq += 1;
            if self.seq > MAX_SEQUENCE {
                self.last_secs += 1;
                self.seq = self.start;
            }
        }
        format_id(self.last_secs, self.seq)
    }
}

fn random_start() -> u32 {
    let mut buf = [0u8; 4];
    let raw = if getrandom::getrandom(&mut buf).is_ok() {
        u32::from_le_bytes(buf)
    } else {
        let nanos = OffsetDateTime::now_utc().nanosecond();
        std::process::id().wrapping_mul(2_654_435_761) ^ nanos
    };
    raw % MAX_SEQUENCE_START + 1
}

fn format_id(unix_secs: i64, seq: u32) -> String {
    let dt = OffsetDateTime::from_unix_timestamp(unix_secs).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}-{:04}",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        seq
    )
}

pub fn is_valid_id(id: &str) -> bool {
    let b = id.as_bytes();
    b.len() == ID_LEN
        && b.iter().enumerate().all(|(i, c)| match i {
            8 | 15 => *c == b'-',
            _ => c.is_ascii_digit(),
        })
}

/// The creation second encoded in an id.
pub fn id_time(id: &str) -> Option<OffsetDateTime> {
    if !is_valid_id(id) {
        return None;
    }
    let num = |range: std::ops::Range<usize>| id.get(range)?.parse::<u32>().ok();

    let year = i32::try_from(num(0..4)?).ok()?;
    let month = Month::try_from(u8::try_from(num(4..6)?).ok()?).ok()?;
    let day = u8::try_from(num(6..8)?).ok()?;
    let hour = u8::try_from(num(9..11)?).ok()?;
    let minute = u8::try_from(num(11..13)?).ok()?;
    let second = u8::try_from(num(13..15)?).ok()?;

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

pub mod rfc3339 {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        let v = t.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        s.serialize_str(&v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let s = String::deserialize(d)?;
        OffsetDateTime::parse(&s, &Rfc3339).map_err(D::Error::custom)
    }

    pub fn format(t: OffsetDateTime) -> String {
        t.format(&Rfc3339).unwrap_or_default()
    }

    pub fn parse(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
        OffsetDateTime::parse(s.trim(), &Rfc3339)
    }
}
