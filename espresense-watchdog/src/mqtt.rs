use crate::config::{BrokerEndpoint, Cli, MqttConf};
use crate::health::HealthTracker;
use crate::scheduler::wait_for_shutdown;
use crate::telemetry::TelemetryIngestor;
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// MQTT v5 session: persistent (clean_start off, 30 min expiry) so a short
/// disconnect keeps the subscription on the broker side.
pub fn mqtt_options(conf: &MqttConf, endpoint: &BrokerEndpoint, cli: &Cli) -> MqttOptions {
    let mut opts = MqttOptions::new(conf.client_id.clone(), endpoint.host.clone(), endpoint.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    opts.set_credentials(cli.mqtt_user.clone(), cli.mqtt_pass.clone());
    opts.set_clean_start(false);
    let mut props = ConnectProperties::new();
    props.session_expiry_interval = Some(conf.session_expiry_secs);
    opts.set_connect_properties(props);
    opts
}

pub fn spawn_telemetry_listener(
    opts: MqttOptions,
    ingestor: TelemetryIngestor,
    health: HealthTracker,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        info!("starting MQTT listener");
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let topic = ingestor.topic_pattern().to_string();

        loop {
            let event = tokio::select! {
                event = eventloop.poll() => event,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    health.mark_mqtt_connected();
                    info!(code = ?ack.code, "connected to MQTT broker");
                    // resubscribe on every connack, the broker may have dropped the session
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                        error!(%topic, error = ?e, "subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(reasons = ?ack.return_codes, "subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let topic = String::from_utf8_lossy(&p.topic);
                    // errors are logged and counted inside ingest
                    let _ = ingestor.ingest(&topic, &p.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect(d))) => {
                    health.mark_mqtt_disconnected();
                    warn!(reason = ?d.reason_code, "broker closed the session");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection error");
                    health.increment_reconnects();
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!(error = ?e, "disconnect request not queued");
        }
        health.mark_mqtt_disconnected();
        info!("MQTT listener stopped");
    })
}
