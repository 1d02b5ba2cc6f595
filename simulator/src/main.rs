mod payload;

use chrono::Local;
use clap::Parser;
use payload::DataRequest;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const TEMPERATURE_TOPIC: &str = "home/temperature";
const POWER_TOPIC: &str = "home/power";
const FINGERPRINT_TOPIC: &str = "home/fingerprint";

/// (request prefix, response prefix) per event class.
const EXCHANGES: [(&str, &str); 3] = [
    ("home/gettemp", "home/datatemp"),
    ("home/getpower", "home/datapower"),
    ("home/getfingerprint", "home/datafingerprint"),
];

/// Publishes synthetic device traffic and periodic data requests against a bridge instance.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER_HOST", default_value = "localhost")]
    broker_host: String,

    #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    broker_port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Instance id of the bridge to request data from
    #[arg(long, env = "TARGET_CLIENT_ID", default_value = "mqtt_client_1")]
    target_client_id: String,

    /// This client's id; random when omitted
    #[arg(long, env = "TEST_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "TEMP_DEVICE_ID", default_value = "temp_sensor_01")]
    temp_device_id: String,

    #[arg(long, env = "POWER_DEVICE_ID", default_value = "power_switch_01")]
    power_device_id: String,

    #[arg(long, env = "FP_DEVICE_ID", default_value = "fingerprint_01")]
    fingerprint_device_id: String,

    /// Date (YYYY-MM-DD) to request; today when omitted
    #[arg(long, env = "REQUEST_DATE")]
    date: Option<String>,

    #[arg(long, env = "TEMP_INTERVAL", default_value_t = 5)]
    temp_interval: u64,

    #[arg(long, env = "POWER_INTERVAL", default_value_t = 15)]
    power_interval: u64,

    #[arg(long, env = "FINGERPRINT_INTERVAL", default_value_t = 20)]
    fingerprint_interval: u64,

    #[arg(long, env = "REQUEST_INTERVAL", default_value_t = 300)]
    request_interval: u64,
}

impl Args {
    fn device_for(&self, request_prefix: &str) -> &str {
        match request_prefix {
            "home/gettemp" => &self.temp_device_id,
            "home/getpower" => &self.power_device_id,
            _ => &self.fingerprint_device_id,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let client_id = args
        .client_id
        .clone()
        .unwrap_or_else(|| format!("sim-{}", uuid::Uuid::new_v4().simple()));
    let request_date = args
        .date
        .clone()
        .unwrap_or_else(|| Local::now().date_naive().format("%Y-%m-%d").to_string());

    info!("Starting traffic simulator {}", client_id);
    info!("Broker: {}:{}, target: {}", args.broker_host, args.broker_port, args.target_client_id);

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker_host, args.broker_port);
    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        mqtt_options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    let response_topics: Vec<String> = EXCHANGES
        .iter()
        .map(|(_, response)| format!("{}/{}", response, args.target_client_id))
        .collect();

    // Spawn eventloop handler
    let subscriber = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    // Clean sessions drop subscriptions, so renew them on every connect.
                    for topic in &response_topics {
                        match subscriber.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                            Ok(()) => info!("Subscribed to {}", topic),
                            Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    log_response(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    let mut rng = rand::thread_rng();
    let mut temp_tick = tokio::time::interval(Duration::from_secs(args.temp_interval.max(1)));
    let mut power_tick = tokio::time::interval(Duration::from_secs(args.power_interval.max(1)));
    let mut fingerprint_tick =
        tokio::time::interval(Duration::from_secs(args.fingerprint_interval.max(1)));
    let mut request_tick = tokio::time::interval(Duration::from_secs(args.request_interval.max(1)));

    loop {
        tokio::select! {
            _ = temp_tick.tick() => {
                let event = payload::temperature(&mut rng, &args.temp_device_id);
                publish_json(&client, TEMPERATURE_TOPIC, &event).await;
            }
            _ = power_tick.tick() => {
                let event = payload::power(&mut rng, &args.power_device_id);
                publish_json(&client, POWER_TOPIC, &event).await;
            }
            _ = fingerprint_tick.tick() => {
                let event = payload::fingerprint(&mut rng, &args.fingerprint_device_id);
                publish_json(&client, FINGERPRINT_TOPIC, &event).await;
            }
            _ = request_tick.tick() => {
                for (request_prefix, _) in EXCHANGES {
                    let topic = format!("{}/{}", request_prefix, args.target_client_id);
                    let request = DataRequest {
                        device_id: args.device_for(request_prefix).to_string(),
                        date: request_date.clone(),
                    };
                    info!("Requesting {} data for {} on {}", request.device_id, request.date, topic);
                    publish_json(&client, &topic, &request).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("Failed to disconnect cleanly: {}", e);
    }
    info!("Simulator stopped");
}

async fn publish_json<T: Serialize>(client: &AsyncClient, topic: &str, body: &T) {
    let payload = match serde_json::to_vec(body) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize payload for {}: {}", topic, e);
            return;
        }
    };

    match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        Ok(()) => debug!("Published to {}", topic),
        Err(e) => warn!("Failed to publish to {}: {}", topic, e),
    }
}

fn log_response(topic: &str, payload: &[u8]) {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(body) => info!(
            "Response on {}: device={} date={} count={}",
            topic,
            body["device_id"],
            body["date"],
            body["count"]
        ),
        Err(e) => warn!("Unparseable response on {}: {}", topic, e),
    }
    debug!("Response body: {}", String::from_utf8_lossy(payload));
}
