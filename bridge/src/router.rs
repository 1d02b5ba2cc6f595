use crate::errors::{Error, Result};
use crate::model::EventClass;

pub const TEMPERATURE_DEVICE_TOPIC: &str = "home/temperature";
pub const POWER_DEVICE_TOPIC: &str = "home/power";
pub const FINGERPRINT_DEVICE_TOPIC: &str = "home/fingerprint";

pub const TEMP_REQUEST_TOPIC_PREFIX: &str = "home/gettemp";
pub const POWER_REQUEST_TOPIC_PREFIX: &str = "home/getpower";
pub const FINGERPRINT_REQUEST_TOPIC_PREFIX: &str = "home/getfingerprint";

pub const TEMP_DATA_TOPIC_PREFIX: &str = "home/datatemp";
pub const POWER_DATA_TOPIC_PREFIX: &str = "home/datapower";
pub const FINGERPRINT_DATA_TOPIC_PREFIX: &str = "home/datafingerprint";

pub fn device_topic(class: EventClass) -> &'static str {
    match class {
        EventClass::Temperature => TEMPERATURE_DEVICE_TOPIC,
        EventClass::Power => POWER_DEVICE_TOPIC,
        EventClass::Fingerprint => FINGERPRINT_DEVICE_TOPIC,
    }
}

pub fn request_prefix(class: EventClass) -> &'static str {
    match class {
        EventClass::Temperature => TEMP_REQUEST_TOPIC_PREFIX,
        EventClass::Power => POWER_REQUEST_TOPIC_PREFIX,
        EventClass::Fingerprint => FINGERPRINT_REQUEST_TOPIC_PREFIX,
    }
}

pub fn response_prefix(class: EventClass) -> &'static str {
    match class {
        EventClass::Temperature => TEMP_DATA_TOPIC_PREFIX,
        EventClass::Power => POWER_DATA_TOPIC_PREFIX,
        EventClass::Fingerprint => FINGERPRINT_DATA_TOPIC_PREFIX,
    }
}

/// Handler selected for an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Ingest(EventClass),
    /// History request; `requester` is the last path segment of the topic.
    Request { class: EventClass, requester: String },
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Prefix(String),
}

/// Topic table for one bridge instance, resolved once at construction.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    instance_id: String,
    table: Vec<(Pattern, EventClass)>,
    response_topics: [(EventClass, String); 3],
}

impl TopicRouter {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();

        let mut table = Vec::with_capacity(6);
        for class in EventClass::ALL {
            table.push((Pattern::Exact(device_topic(class).to_string()), class));
        }
        for class in EventClass::ALL {
            table.push((Pattern::Prefix(format!("{}/", request_prefix(class))), class));
        }

        let response_topics = EventClass::ALL
            .map(|class| (class, format!("{}/{}", response_prefix(class), instance_id)));

        Self {
            instance_id,
            table,
            response_topics,
        }
    }

    /// Topics this instance subscribes to after every (re)connect.
    pub fn subscriptions(&self) -> Vec<String> {
        EventClass::ALL
            .iter()
            .map(|class| device_topic(*class).to_string())
            .chain(
                EventClass::ALL
                    .iter()
                    .map(|class| format!("{}/{}", request_prefix(*class), self.instance_id)),
            )
            .collect()
    }

    pub fn response_topic(&self, class: EventClass) -> &str {
        self.response_topics
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, topic)| topic.as_str())
            .unwrap_or_default()
    }

    pub fn resolve(&self, topic: &str) -> Result<Route> {
        for (pattern, class) in &self.table {
            match pattern {
                Pattern::Exact(exact) if topic == exact.as_str() => return Ok(Route::Ingest(*class)),
                Pattern::Prefix(prefix) if topic.starts_with(prefix.as_str()) => {
                    let requester = &topic[prefix.len()..];
                    if requester.is_empty() || requester.contains('/') {
                        return Err(unroutable(topic, "request topic needs a single instance suffix"));
                    }
                    if requester != self.instance_id {
                        return Err(unroutable(
                            topic,
                            &format!("addressed to instance {:?}", requester),
                        ));
                    }
                    return Ok(Route::Request {
                        class: *class,
                        requester: requester.to_string(),
                    });
                }
                _ => {}
            }
        }

        Err(unroutable(topic, "no handler for topic"))
    }
}

fn unroutable(topic: &str, reason: &str) -> Error {
    Error::Routing {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}
