use crate::errors::PayloadError;
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

/// The three device classes the bridge ingests and answers queries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Temperature,
    Power,
    Fingerprint,
}

impl EventClass {
    pub const ALL: [EventClass; 3] = [
        EventClass::Temperature,
        EventClass::Power,
        EventClass::Fingerprint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Temperature => "temperature",
            EventClass::Power => "power",
            EventClass::Fingerprint => "fingerprint",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mains (EB) or generator (DG) supply state reported by a power monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyStatus {
    On,
    Off,
}

impl SupplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupplyStatus::On => "ON",
            SupplyStatus::Off => "OFF",
        }
    }
}

impl TryFrom<String> for SupplyStatus {
    type Error = PayloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "ON" => Ok(SupplyStatus::On),
            "OFF" => Ok(SupplyStatus::Off),
            other => Err(PayloadError::Invalid {
                field: "status",
                reason: format!("must be ON or OFF, got {:?}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Pass,
    Fail,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Pass => "PASS",
            AuthStatus::Fail => "FAIL",
        }
    }
}

impl TryFrom<String> for AuthStatus {
    type Error = PayloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "PASS" => Ok(AuthStatus::Pass),
            "FAIL" => Ok(AuthStatus::Fail),
            other => Err(PayloadError::Invalid {
                field: "auth_status",
                reason: format!("must be PASS or FAIL, got {:?}", other),
            }),
        }
    }
}

/// Temperature/humidity sample.
///
/// `timestamp` is kept exactly as the device sent it. `occurred_at` is the same
/// instant normalized to UTC and is only used for ordering; `date` is the calendar
/// date written in the timestamp and is the lookup key.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TemperatureReading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub status: String,
    pub timestamp: String,
    pub occurred_at: NaiveDateTime,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PowerStatusEvent {
    pub device_id: String,
    #[sqlx(rename = "ebstatus", try_from = "String")]
    pub mains: SupplyStatus,
    #[sqlx(rename = "dgstatus", try_from = "String")]
    pub generator: SupplyStatus,
    pub timestamp: String,
    pub occurred_at: NaiveDateTime,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FingerprintAuthEvent {
    pub device_id: String,
    pub user_id: String,
    #[sqlx(try_from = "String")]
    pub auth_status: AuthStatus,
    pub timestamp: String,
    pub occurred_at: NaiveDateTime,
    pub date: NaiveDate,
}

/// A validated event ready to be appended.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Temperature(TemperatureReading),
    Power(PowerStatusEvent),
    Fingerprint(FingerprintAuthEvent),
}

impl EventRecord {
    pub fn class(&self) -> EventClass {
        match self {
            EventRecord::Temperature(_) => EventClass::Temperature,
            EventRecord::Power(_) => EventClass::Power,
            EventRecord::Fingerprint(_) => EventClass::Fingerprint,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            EventRecord::Temperature(r) => &r.device_id,
            EventRecord::Power(r) => &r.device_id,
            EventRecord::Fingerprint(r) => &r.device_id,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            EventRecord::Temperature(r) => r.date,
            EventRecord::Power(r) => r.date,
            EventRecord::Fingerprint(r) => r.date,
        }
    }

    pub fn occurred_at(&self) -> NaiveDateTime {
        match self {
            EventRecord::Temperature(r) => r.occurred_at,
            EventRecord::Power(r) => r.occurred_at,
            EventRecord::Fingerprint(r) => r.occurred_at,
        }
    }
}

/// Historical query decoded from a request topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub device_id: String,
    pub date: NaiveDate,
}

/// A publish delivered by the broker, handed from the connection loop to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}
