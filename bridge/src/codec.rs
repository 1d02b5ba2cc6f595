use crate::errors::{PayloadError, Result};
use crate::model::{
    AuthStatus, DataRequest, EventClass, EventRecord, FingerprintAuthEvent, PowerStatusEvent,
    SupplyStatus, TemperatureReading,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::{Map, Value};

type Object = Map<String, Value>;

/// Decodes and validates a device payload for the given class.
///
/// Nothing is returned unless every required field is present and well-typed,
/// so a rejected payload never leads to a partial write.
pub fn decode_event(class: EventClass, payload: &[u8]) -> std::result::Result<EventRecord, PayloadError> {
    let obj = parse_object(payload)?;

    let device_id = required_str(&obj, "device_id")?.to_string();
    let timestamp = required_str(&obj, "timestamp")?.to_string();
    let (occurred_at, date) = parse_timestamp(&timestamp)?;

    let record = match class {
        EventClass::Temperature => EventRecord::Temperature(TemperatureReading {
            device_id,
            temperature: required_f64(&obj, "temperature")?,
            humidity: required_f64(&obj, "humidity")?,
            status: optional_str(&obj, "status")?,
            timestamp,
            occurred_at,
            date,
        }),
        EventClass::Power => EventRecord::Power(PowerStatusEvent {
            device_id,
            mains: supply_status(&obj, "ebstatus")?,
            generator: supply_status(&obj, "dgstatus")?,
            timestamp,
            occurred_at,
            date,
        }),
        EventClass::Fingerprint => {
            let user_id = required_str(&obj, "user_id")?.to_string();
            let auth_status = AuthStatus::try_from(required_str(&obj, "auth_status")?.to_string())?;
            EventRecord::Fingerprint(FingerprintAuthEvent {
                device_id,
                user_id,
                auth_status,
                timestamp,
                occurred_at,
                date,
            })
        }
    };

    Ok(record)
}

/// Decodes a `{"device_id", "date"}` history request.
pub fn decode_request(payload: &[u8]) -> std::result::Result<DataRequest, PayloadError> {
    let obj = parse_object(payload)?;
    let device_id = required_str(&obj, "device_id")?.to_string();
    let date = parse_calendar_date("date", required_str(&obj, "date")?)?;
    Ok(DataRequest { device_id, date })
}

#[derive(Serialize)]
struct ResponseBody<'a> {
    device_id: &'a str,
    date: String,
    count: usize,
    records: Vec<ResponseEntry<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ResponseEntry<'a> {
    Temperature {
        temperature: f64,
        humidity: f64,
        timestamp: &'a str,
    },
    Power {
        ebstatus: &'static str,
        dgstatus: &'static str,
        timestamp: &'a str,
    },
    Fingerprint {
        user_id: &'a str,
        auth_status: &'static str,
        timestamp: &'a str,
    },
}

impl<'a> From<&'a EventRecord> for ResponseEntry<'a> {
    fn from(record: &'a EventRecord) -> Self {
        match record {
            EventRecord::Temperature(r) => ResponseEntry::Temperature {
                temperature: r.temperature,
                humidity: r.humidity,
                timestamp: &r.timestamp,
            },
            EventRecord::Power(r) => ResponseEntry::Power {
                ebstatus: r.mains.as_str(),
                dgstatus: r.generator.as_str(),
                timestamp: &r.timestamp,
            },
            EventRecord::Fingerprint(r) => ResponseEntry::Fingerprint {
                user_id: &r.user_id,
                auth_status: r.auth_status.as_str(),
                timestamp: &r.timestamp,
            },
        }
    }
}

/// Serializes query results as `{device_id, date, count, records}`.
pub fn encode_response(device_id: &str, date: NaiveDate, records: &[EventRecord]) -> Result<Vec<u8>> {
    let body = ResponseBody {
        device_id,
        date: date.format("%Y-%m-%d").to_string(),
        count: records.len(),
        records: records.iter().map(ResponseEntry::from).collect(),
    };
    Ok(serde_json::to_vec(&body)?)
}

/// Parses a strict `YYYY-MM-DD` calendar date.
///
/// The shape is checked before handing off to chrono, which would otherwise
/// accept unpadded forms such as `24-1-1`.
pub fn parse_calendar_date(field: &'static str, raw: &str) -> std::result::Result<NaiveDate, PayloadError> {
    let bytes = raw.as_bytes();
    let shaped = bytes.len() == 10
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| if i == 4 || i == 7 { *b == b'-' } else { b.is_ascii_digit() });
    if !shaped {
        return Err(PayloadError::Invalid {
            field,
            reason: format!("must be YYYY-MM-DD, got {:?}", raw),
        });
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| PayloadError::Invalid {
        field,
        reason: format!("{:?} is not a calendar date", raw),
    })
}

const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M%z",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Returns the UTC-normalized instant and the calendar date written in the timestamp.
pub fn parse_timestamp(raw: &str) -> std::result::Result<(NaiveDateTime, NaiveDate), PayloadError> {
    let invalid = || PayloadError::Invalid {
        field: "timestamp",
        reason: format!("{:?} is not an ISO-8601 date-time", raw),
    };

    let date_part = raw.get(..10).ok_or_else(invalid)?;
    let date = parse_calendar_date("timestamp", date_part).map_err(|_| invalid())?;

    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Ok((with_offset.naive_utc(), date));
    }

    // `%z` takes both `+05:30` and the basic `+0530` form.
    for format in OFFSET_FORMATS {
        if let Ok(with_offset) = DateTime::parse_from_str(raw, format) {
            return Ok((with_offset.naive_utc(), date));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok((naive, date));
        }
    }

    Err(invalid())
}

fn parse_object(payload: &[u8]) -> std::result::Result<Object, PayloadError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(other) => Err(PayloadError::Malformed(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
        Err(e) => Err(PayloadError::Malformed(format!("JSON parse error: {}", e))),
    }
}

fn required_str<'a>(obj: &'a Object, field: &'static str) -> std::result::Result<&'a str, PayloadError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(PayloadError::Invalid {
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(PayloadError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn optional_str(obj: &Object, field: &'static str) -> std::result::Result<String, PayloadError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(PayloadError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn required_f64(obj: &Object, field: &'static str) -> std::result::Result<f64, PayloadError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField(field)),
        Some(Value::Number(n)) => n.as_f64().ok_or(PayloadError::WrongType {
            field,
            expected: "a finite number",
        }),
        Some(_) => Err(PayloadError::WrongType {
            field,
            expected: "a number",
        }),
    }
}

fn supply_status(obj: &Object, field: &'static str) -> std::result::Result<SupplyStatus, PayloadError> {
    SupplyStatus::try_from(required_str(obj, field)?.to_string()).map_err(|e| match e {
        PayloadError::Invalid { reason, .. } => PayloadError::Invalid { field, reason },
        other => other,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
