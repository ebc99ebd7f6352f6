//! Shared value types: identifiers, document types and timestamps
use crate::error::ValidationError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type UserId = u64;
pub type CompanyId = u64;
pub type FactoryId = u64;
pub type RoleId = u64;
pub type StepOrder = u32;

/// The engineering documents routed through approval.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "lowercase")]
#[cbor(index_only)]
pub enum DocumentType {
    /// Welding procedure specification
    #[n(0)]
    Wps,
    /// Procedure qualification record
    #[n(1)]
    Pqr,
    /// Preliminary procedure qualification record
    #[n(2)]
    Ppqr,
}

impl DocumentType {
    pub const ALL: [DocumentType; 3] = [DocumentType::Wps, DocumentType::Pqr, DocumentType::Ppqr];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Wps => "wps",
            DocumentType::Pqr => "pqr",
            DocumentType::Ppqr => "ppqr",
        }
    }

    /// Stable single-byte tag used in storage keys.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            DocumentType::Wps => 0,
            DocumentType::Pqr => 1,
            DocumentType::Ppqr => 2,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wps" => Ok(DocumentType::Wps),
            "pqr" => Ok(DocumentType::Pqr),
            "ppqr" => Ok(DocumentType::Ppqr),
            _ => Err(ValidationError::UnknownDocumentType(s.to_string())),
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
    /// Time elapsed between `self` and a later instant. Negative if `later` is earlier.
    pub fn elapsed_until(&self, later: TimeStamp) -> Duration {
        later.0 - self.0
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
