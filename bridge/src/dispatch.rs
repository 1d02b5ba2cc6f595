use crate::codec::{decode_event, decode_request, encode_response};
use crate::db::Store;
use crate::errors::{Error, Result};
use crate::metrics::{EVENTS_STORED_TOTAL, REJECTED_MESSAGES_TOTAL, RESPONSES_PUBLISHED_TOTAL};
use crate::model::{EventClass, InboundMessage};
use crate::router::{Route, TopicRouter};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const PAYLOAD_PREVIEW_BYTES: usize = 128;

/// Destination for history responses. Publishing is fire-and-forget: the
/// requester must already be subscribed to the response topic.
pub trait ResponseSink: Send + Sync {
    fn send_response(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

/// What happened to a message that was handled successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stored { class: EventClass, id: i64 },
    Responded { topic: String, count: usize },
}

/// Routes one inbound message at a time to ingestion or history lookup.
pub struct Dispatcher<S> {
    router: TopicRouter,
    store: Store,
    sink: S,
}

impl<S: ResponseSink> Dispatcher<S> {
    pub fn new(router: TopicRouter, store: Store, sink: S) -> Self {
        Self {
            router,
            store,
            sink,
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Outcome> {
        match self.router.resolve(topic)? {
            Route::Ingest(class) => self.ingest(class, payload).await,
            Route::Request { class, requester } => self.answer(class, &requester, payload).await,
        }
    }

    async fn ingest(&self, class: EventClass, payload: &[u8]) -> Result<Outcome> {
        let record = decode_event(class, payload)?;
        let id = self.store.append(&record).await?;

        EVENTS_STORED_TOTAL.with_label_values(&[class.as_str()]).inc();
        info!(
            "Stored {} event {} from device {} for {}",
            class,
            id,
            record.device_id(),
            record.date()
        );
        Ok(Outcome::Stored { class, id })
    }

    async fn answer(&self, class: EventClass, requester: &str, payload: &[u8]) -> Result<Outcome> {
        let request = decode_request(payload)?;
        let records = self
            .store
            .query_by_device_and_date(class, &request.device_id, request.date)
            .await?;

        let body = encode_response(&request.device_id, request.date, &records)?;
        let topic = self.router.response_topic(class).to_string();
        self.sink.send_response(&topic, body).await?;

        RESPONSES_PUBLISHED_TOTAL.with_label_values(&[class.as_str()]).inc();
        info!(
            "Published {} data response on {} for {} - device: {}, date: {}, records: {}",
            class,
            topic,
            requester,
            request.device_id,
            request.date,
            records.len()
        );
        Ok(Outcome::Responded {
            topic,
            count: records.len(),
        })
    }

    /// Handles a message and logs any rejection. Never fails, so one bad
    /// message cannot stop the stream.
    pub async fn dispatch(&self, message: &InboundMessage) -> Option<Outcome> {
        debug!(
            "Received message on topic {}, size: {} bytes",
            message.topic,
            message.payload.len()
        );

        match self.handle(&message.topic, &message.payload).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                let reason = rejection_reason(&e);
                REJECTED_MESSAGES_TOTAL.with_label_values(&[reason]).inc();
                let preview = payload_preview(&message.payload);
                match reason {
                    "storage" | "transport" => error!(
                        "Dropping message on {} ({}): {} - payload: {}",
                        message.topic, reason, e, preview
                    ),
                    _ => warn!(
                        "Dropping message on {} ({}): {} - payload: {}",
                        message.topic, reason, e, preview
                    ),
                }
                None
            }
        }
    }
}

/// Consumes inbound messages strictly in delivery order until the sender side closes.
pub async fn run_dispatcher<S: ResponseSink>(dispatcher: Dispatcher<S>, mut rx: mpsc::Receiver<InboundMessage>) {
    info!("Dispatcher started");
    while let Some(message) = rx.recv().await {
        dispatcher.dispatch(&message).await;
    }
    info!("Dispatcher stopped");
}

fn rejection_reason(error: &Error) -> &'static str {
    match error {
        Error::Payload(e) => e.kind(),
        Error::Routing { .. } => "unroutable",
        Error::Database(_) | Error::Migration(_) => "storage",
        Error::Mqtt(_) => "transport",
        _ => "internal",
    }
}

fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.len() <= PAYLOAD_PREVIEW_BYTES {
        return text.into_owned();
    }
    let mut end = PAYLOAD_PREVIEW_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
