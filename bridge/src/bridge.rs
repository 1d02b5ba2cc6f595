use crate::config::Settings;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::db::Store;
use crate::dispatch::{run_dispatcher, Dispatcher};
use crate::errors::Result;
use crate::mqtt::{self, LinkChannels};
use crate::router::TopicRouter;
use rumqttc::AsyncClient;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running bridge instance: one connection loop and one dispatcher sharing a store.
pub struct Bridge {
    client: AsyncClient,
    store: Store,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    connection: Option<JoinHandle<Result<()>>>,
    dispatcher: JoinHandle<()>,
}

impl Bridge {
    /// Opens storage, then starts the broker session and the dispatcher.
    pub async fn start(settings: &Settings) -> Result<Self> {
        settings.validate()?;

        let store = Store::open(&settings.database_path).await?;
        info!("Database initialized");

        let router = TopicRouter::new(settings.client_id.clone());
        let subscriptions = router.subscriptions();
        let (client, eventloop) = mqtt::create_client(settings);

        let (inbound_tx, inbound_rx) = mpsc::channel(settings.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let dispatcher = Dispatcher::new(router, store.clone(), client.clone());
        let dispatcher = tokio::spawn(run_dispatcher(dispatcher, inbound_rx));

        let manager = ConnectionManager::new(
            settings.reconnect_base_delay,
            settings.max_reconnect_attempts,
        );
        let connection = tokio::spawn(mqtt::run_mqtt(
            client.clone(),
            eventloop,
            subscriptions,
            manager,
            LinkChannels {
                inbound: inbound_tx,
                shutdown: shutdown_rx,
                state: state_tx,
            },
        ));

        info!("Bridge {} started", settings.client_id);
        Ok(Self {
            client,
            store,
            shutdown: shutdown_tx,
            state: state_rx,
            connection: Some(connection),
            dispatcher,
        })
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves when the connection loop ends on its own, which only happens
    /// once the reconnection budget is exhausted. Cancel-safe.
    pub async fn closed(&mut self) -> Result<()> {
        let Some(handle) = self.connection.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.connection = None;
        match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Connection task failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Stops intake, lets the dispatcher finish queued messages, closes the
    /// broker session and releases the store.
    pub async fn stop(mut self) {
        info!("Shutting down bridge");
        // Err only means the connection loop has already exited.
        let _ = self.shutdown.send(true);

        if let Err(e) = self.dispatcher.await {
            error!("Dispatcher task failed: {}", e);
        }

        if let Err(e) = self.client.disconnect().await {
            debug!("Broker session already closed: {}", e);
        }

        if let Some(handle) = self.connection.take() {
            join_connection(handle, SHUTDOWN_GRACE).await;
        }

        self.store.close().await;
        info!("Bridge stopped");
    }
}

/// Waits up to `grace` for the connection loop, aborting it past the deadline.
async fn join_connection(handle: JoinHandle<Result<()>>, grace: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("Connection loop ended with error: {}", e),
        Ok(Err(e)) => error!("Connection task failed: {}", e),
        Err(_) => {
            warn!("Timed out waiting for broker session to close, aborting");
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const SUBSCRIBE: u8 = 8;
    const DISCONNECT: u8 = 14;

    /// Reads one MQTT 3.1.1 control packet as (fixed header byte, body).
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    async fn write_packet(stream: &mut TcpStream, header: u8, body: &[u8]) {
        let mut frame = vec![header];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            frame.push(byte);
            if len == 0 {
                break;
            }
        }
        frame.extend_from_slice(body);
        stream.write_all(&frame).await.unwrap();
    }

    fn read_string(body: &[u8], at: usize) -> (String, usize) {
        let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
        let end = at + 2 + len;
        (String::from_utf8_lossy(&body[at + 2..end]).into_owned(), end)
    }

    /// Accepts a CONNECT and acknowledges subscriptions until `expected` topics arrive.
    async fn accept_session(stream: &mut TcpStream, expected: usize) -> Vec<String> {
        let (header, _) = read_packet(stream).await.unwrap();
        assert_eq!(header >> 4, CONNECT);
        write_packet(stream, 0x20, &[0x00, 0x00]).await;

        let mut topics = Vec::new();
        while topics.len() < expected {
            let (header, body) = read_packet(stream).await.unwrap();
            if header >> 4 != SUBSCRIBE {
                continue;
            }
            let mut at = 2;
            while at < body.len() {
                let (topic, end) = read_string(&body, at);
                topics.push(topic);
                at = end + 1;
            }
            write_packet(stream, 0x90, &[body[0], body[1], 0x01]).await;
        }
        topics
    }

    async fn publish_qos0(stream: &mut TcpStream, topic: &str, payload: &[u8]) {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        write_packet(stream, 0x30, &body).await;
    }

    fn unreachable_settings(max_reconnect_attempts: u32) -> Settings {
        Settings {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            reconnect_base_delay: Duration::from_millis(1),
            max_reconnect_attempts,
            database_path: std::env::temp_dir()
                .join(format!("bridge-test-{}.db", uuid::Uuid::new_v4())),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_fatal() {
        let mut bridge = Bridge::start(&unreachable_settings(1)).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(30), bridge.closed())
            .await
            .expect("connection loop should give up");
        assert!(matches!(result, Err(Error::ReconnectExhausted { attempts: 1 })));
        assert_eq!(*bridge.connection_state().borrow(), ConnectionState::Failed);

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_reconnecting() {
        let settings = Settings {
            reconnect_base_delay: Duration::from_secs(3600),
            ..unreachable_settings(5)
        };
        let bridge = Bridge::start(&settings).await.unwrap();
        let mut state = bridge.connection_state();

        tokio::time::timeout(
            Duration::from_secs(30),
            state.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
        )
        .await
        .expect("first connect attempt should fail")
        .unwrap();

        tokio::time::timeout(Duration::from_secs(30), bridge.stop())
            .await
            .expect("stop should not wait out the backoff");
    }

    #[tokio::test]
    async fn test_rejects_invalid_settings() {
        let settings = Settings {
            client_id: "bad/id".to_string(),
            ..unreachable_settings(1)
        };
        assert!(matches!(Bridge::start(&settings).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_and_stop_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            broker_port: listener.local_addr().unwrap().port(),
            reconnect_base_delay: Duration::from_millis(10),
            ..unreachable_settings(5)
        };
        let expected = TopicRouter::new(settings.client_id.clone()).subscriptions();
        let request_topic = format!("home/gettemp/{}", settings.client_id);
        let topic_count = expected.len();

        let (answered_tx, answered_rx) = oneshot::channel();
        let broker = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            let first_topics = accept_session(&mut first, topic_count).await;
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            let second_topics = accept_session(&mut second, topic_count).await;
            publish_qos0(
                &mut second,
                "home/temperature",
                br#"{"device_id":"t1","temperature":21.5,"humidity":40.0,"timestamp":"2024-03-01T10:00:00"}"#,
            )
            .await;
            publish_qos0(
                &mut second,
                &request_topic,
                br#"{"device_id":"t1","date":"2024-03-01"}"#,
            )
            .await;

            let mut answered_tx = Some(answered_tx);
            let mut response = None;
            let mut disconnected = false;
            while let Ok((header, body)) = read_packet(&mut second).await {
                match header >> 4 {
                    PUBLISH => {
                        let (topic, at) = read_string(&body, 0);
                        write_packet(&mut second, 0x40, &[body[at], body[at + 1]]).await;
                        response = Some((topic, body[at + 2..].to_vec()));
                        if let Some(tx) = answered_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    DISCONNECT => {
                        disconnected = true;
                        break;
                    }
                    _ => {}
                }
            }
            (first_topics, second_topics, response, disconnected)
        });

        let bridge = Bridge::start(&settings).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), answered_rx)
            .await
            .expect("bridge never answered the request")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), bridge.stop())
            .await
            .expect("stop should finish once DISCONNECT is written");

        let (first_topics, second_topics, response, disconnected) =
            tokio::time::timeout(Duration::from_secs(10), broker)
                .await
                .expect("broker never saw the session end")
                .unwrap();

        assert_eq!(first_topics, expected);
        assert_eq!(second_topics, expected);

        let (topic, payload) = response.unwrap();
        assert_eq!(topic, format!("home/datatemp/{}", settings.client_id));
        let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(body["device_id"], "t1");
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["temperature"], 21.5);

        assert!(disconnected, "no DISCONNECT after stop");
    }

    #[tokio::test]
    async fn test_panicked_connection_task_is_an_error() {
        let settings = unreachable_settings(1);
        let (client, _eventloop) = mqtt::create_client(&settings);
        let (shutdown, _) = watch::channel(false);
        let (_, state) = watch::channel(ConnectionState::Disconnected);
        let mut bridge = Bridge {
            client,
            store: Store::open_temp().await,
            shutdown,
            state,
            connection: Some(tokio::spawn(async { panic!("connection loop crashed") })),
            dispatcher: tokio::spawn(async {}),
        };

        assert!(matches!(bridge.closed().await, Err(Error::Task(_))));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_join_connection_aborts_after_grace() {
        let handle: JoinHandle<Result<()>> = tokio::spawn(std::future::pending());
        let watcher = handle.abort_handle();

        join_connection(handle, Duration::from_millis(10)).await;

        for _ in 0..100 {
            if watcher.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(watcher.is_finished());
    }
}
