use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Serialize)]
pub struct TemperatureEvent {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerEvent {
    pub device_id: String,
    pub ebstatus: String,
    pub dgstatus: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FingerprintEvent {
    pub device_id: String,
    pub user_id: String,
    pub auth_status: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataRequest {
    pub device_id: String,
    pub date: String,
}

fn stamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn on_off(rng: &mut impl Rng) -> String {
    if rng.gen_bool(0.5) { "ON" } else { "OFF" }.to_string()
}

pub fn temperature(rng: &mut impl Rng, device_id: &str) -> TemperatureEvent {
    TemperatureEvent {
        device_id: device_id.to_string(),
        temperature: round2(rng.gen_range(20.0..30.0)),
        humidity: round2(rng.gen_range(30.0..70.0)),
        timestamp: stamp(Utc::now().naive_utc()),
    }
}

pub fn power(rng: &mut impl Rng, device_id: &str) -> PowerEvent {
    PowerEvent {
        device_id: device_id.to_string(),
        ebstatus: on_off(rng),
        dgstatus: on_off(rng),
        timestamp: stamp(Utc::now().naive_utc()),
    }
}

pub fn fingerprint(rng: &mut impl Rng, device_id: &str) -> FingerprintEvent {
    let auth_status = if rng.gen_bool(0.5) { "PASS" } else { "FAIL" };
    FingerprintEvent {
        device_id: device_id.to_string(),
        user_id: format!("user_{}", rng.gen_range(100..=999)),
        auth_status: auth_status.to_string(),
        timestamp: stamp(Utc::now().naive_utc()),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_timestamp_shape() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(10, 0, 5, 750)
            .unwrap();
        assert_eq!(stamp(at), "2024-03-01T10:00:05");
    }

    #[test]
    fn test_generated_values_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let t = temperature(&mut rng, "temp_sensor_01");
            assert!((20.0..=30.0).contains(&t.temperature));
            assert!((30.0..=70.0).contains(&t.humidity));

            let p = power(&mut rng, "power_switch_01");
            assert!(["ON", "OFF"].contains(&p.ebstatus.as_str()));
            assert!(["ON", "OFF"].contains(&p.dgstatus.as_str()));

            let f = fingerprint(&mut rng, "fingerprint_01");
            assert!(["PASS", "FAIL"].contains(&f.auth_status.as_str()));
            let n: u32 = f.user_id.strip_prefix("user_").unwrap().parse().unwrap();
            assert!((100..=999).contains(&n));
        }
    }

    #[test]
    fn test_power_wire_keys() {
        let mut rng = rand::thread_rng();
        let value = serde_json::to_value(power(&mut rng, "p1")).unwrap();
        assert!(value.get("ebstatus").is_some());
        assert!(value.get("dgstatus").is_some());
        assert_eq!(value["device_id"], "p1");
    }
}
