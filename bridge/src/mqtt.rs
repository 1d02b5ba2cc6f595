use crate::config::Settings;
use crate::connection::{ConnectionManager, ConnectionState, Directive, LinkEvent};
use crate::dispatch::ResponseSink;
use crate::errors::{Error, Result};
use crate::metrics::{CONNECTED, MESSAGES_TOTAL, RECONNECT_ATTEMPTS_TOTAL};
use crate::model::InboundMessage;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10000;

pub fn create_client(settings: &Settings) -> (AsyncClient, EventLoop) {
    let mut mqtt_options = MqttOptions::new(
        settings.client_id.clone(),
        settings.broker_host.clone(),
        settings.broker_port,
    );
    mqtt_options.set_keep_alive(settings.keepalive);
    mqtt_options.set_clean_session(false);

    // Stored on the options, so every reconnect presents them again.
    if let Some(credentials) = &settings.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY)
}

impl ResponseSink for AsyncClient {
    async fn send_response(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

/// Channels the connection loop shares with the rest of the bridge.
pub struct LinkChannels {
    pub inbound: mpsc::Sender<InboundMessage>,
    pub shutdown: watch::Receiver<bool>,
    pub state: watch::Sender<ConnectionState>,
}

/// Drives the broker session until shutdown or until the reconnection budget is spent.
///
/// Returns `Error::ReconnectExhausted` in the latter case. On shutdown, stops
/// forwarding messages and keeps the session alive until the client's
/// `disconnect()` request has gone out, so responses still queued by the
/// dispatcher are delivered first.
pub async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscriptions: Vec<String>,
    mut manager: ConnectionManager,
    channels: LinkChannels,
) -> Result<()> {
    let LinkChannels {
        inbound,
        mut shutdown,
        state,
    } = channels;

    let (host, port) = eventloop.mqtt_options.broker_address();
    info!("Connecting to MQTT broker at {}:{}", host, port);

    let mut directive = manager.handle(LinkEvent::Start);

    loop {
        publish_state(&state, manager.state());

        match directive {
            Directive::Halt => {
                error!("Max reconnection attempts reached. Giving up on broker.");
                return Err(Error::ReconnectExhausted {
                    attempts: manager.attempts(),
                });
            }
            Directive::Wait(delay) => {
                RECONNECT_ATTEMPTS_TOTAL.inc();
                warn!("Reconnection attempt {} in {:?}", manager.attempts(), delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        directive = manager.handle(LinkEvent::BackoffElapsed);
                        continue;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            Directive::Subscribe => {
                for topic in &subscriptions {
                    client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;
                    info!("Subscribed to topic: {}", topic);
                }
            }
            Directive::Connect | Directive::Idle => {}
        }

        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = shutdown.changed() => break,
        };

        directive = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(
                    "Connected to MQTT broker (session present: {})",
                    ack.session_present
                );
                manager.handle(LinkEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                forward(
                    &inbound,
                    InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    },
                )
                .await?;
                Directive::Idle
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
                Directive::Idle
            }
            Ok(_) => Directive::Idle,
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                manager.handle(LinkEvent::Down {
                    reason: e.to_string(),
                })
            }
        };
    }

    // Stop accepting inbound messages; the dispatcher drains what it already has.
    drop(inbound);

    if manager.state() == ConnectionState::Connected {
        linger(&mut eventloop).await;
    }
    manager.handle(LinkEvent::Closed);
    publish_state(&state, manager.state());
    info!("MQTT client disconnected");
    Ok(())
}

async fn forward(inbound: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> Result<()> {
    match inbound.try_send(message) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(message)) => {
            debug!("Dispatch queue full, waiting for capacity");
            inbound.send(message).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Dispatch channel closed, cannot forward message");
            Err(Error::ChannelSend)
        }
    }
}

/// Keeps polling until the outgoing DISCONNECT has been written or the link fails.
async fn linger(eventloop: &mut EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                warn!("Ignoring message on {} received during shutdown", publish.topic);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Connection closed during shutdown: {}", e);
                return;
            }
        }
    }
}

fn publish_state(state: &watch::Sender<ConnectionState>, current: ConnectionState) {
    CONNECTED.set(if current == ConnectionState::Connected { 1.0 } else { 0.0 });
    state.send_if_modified(|previous| {
        if *previous == current {
            return false;
        }
        debug!("Connection state: {} -> {}", previous, current);
        *previous = current;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use std::time::Duration;

    #[test]
    fn test_credentials_reach_connect_options() {
        let settings = Settings {
            credentials: Some(Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
            ..Settings::default()
        };
        let (_client, eventloop) = create_client(&settings);
        assert_eq!(
            eventloop.mqtt_options.credentials(),
            Some(("u".to_string(), "p".to_string()))
        );
        assert!(!eventloop.mqtt_options.clean_session());

        let (_client, eventloop) = create_client(&Settings::default());
        assert_eq!(eventloop.mqtt_options.credentials(), None);
    }

    #[test]
    fn test_forward_valid() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(1);
            let message = InboundMessage {
                topic: "home/temperature".to_string(),
                payload: b"{}".to_vec(),
            };

            forward(&tx, message.clone()).await.unwrap();
            assert_eq!(rx.recv().await.unwrap(), message);
        });
    }

    #[test]
    fn test_forward_closed_channel() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            let message = InboundMessage {
                topic: "home/temperature".to_string(),
                payload: Vec::new(),
            };
            assert!(matches!(forward(&tx, message).await, Err(Error::ChannelSend)));
        });
    }

    #[test]
    fn test_publish_state_tracks_changes() {
        let (tx, mut rx) = watch::channel(ConnectionState::Disconnected);

        publish_state(&tx, ConnectionState::Disconnected);
        assert!(!rx.has_changed().unwrap());

        publish_state(&tx, ConnectionState::Connected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }

    #[test]
    fn test_unreachable_broker_exhausts_budget() {
        tokio_test::block_on(async {
            // Port 1 on loopback refuses connections immediately.
            let settings = Settings {
                broker_host: "127.0.0.1".to_string(),
                broker_port: 1,
                ..Settings::default()
            };
            let (client, eventloop) = create_client(&settings);
            let (inbound, _rx) = mpsc::channel(1);
            let (_shutdown_tx, shutdown) = watch::channel(false);
            let (state, state_rx) = watch::channel(ConnectionState::Disconnected);

            let result = run_mqtt(
                client,
                eventloop,
                vec!["home/temperature".to_string()],
                ConnectionManager::new(Duration::from_millis(1), 2),
                LinkChannels {
                    inbound,
                    shutdown,
                    state,
                },
            )
            .await;

            assert!(matches!(result, Err(Error::ReconnectExhausted { attempts: 2 })));
            assert_eq!(*state_rx.borrow(), ConnectionState::Failed);
        });
    }
}
