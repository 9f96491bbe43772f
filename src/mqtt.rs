use crate::config::Config;
use crate::delivery::{Acknowledge, DeliveryLoop};
use crate::sink::Sink;
use crate::stats::BridgeStats;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS, Transport};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Acknowledges one publish back to the broker (PUBACK for QoS 1).
pub struct MqttAck {
    client: AsyncClient,
    publish: Publish,
}

impl Acknowledge for MqttAck {
    async fn acknowledge(self) -> Result<()> {
        self.client.ack(&self.publish).await?;
        Ok(())
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    // The broker keeps our subscription and unacknowledged messages while we
    // are away, and only an explicit ack completes a delivery.
    options.set_clean_session(false);
    options.set_manual_acks(true);
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    if config.mqtt_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Runs until `shutdown` resolves. Connection loss is logged and the event
/// loop reconnects on the next poll with the same session.
pub async fn run_listener<S: Sink>(
    config: &Config,
    mut delivery: DeliveryLoop<S>,
    stats: Arc<BridgeStats>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), 64);
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                stats.set_mqtt_connected(true);
                tracing::info!(session_present = connack.session_present, "connected to MQTT server");
                // Called from inside the poll loop, so it must not wait on the
                // request channel.
                match client.try_subscribe(config.mqtt_topic.clone(), QoS::AtLeastOnce) {
                    Ok(()) => tracing::info!(topic = %config.mqtt_topic, "subscribed to sensor events"),
                    Err(err) => tracing::warn!(error = %err, "failed to queue subscription"),
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let mut payload = publish.payload.to_vec();
                let topic = publish.topic.clone();
                let ack = MqttAck {
                    client: client.clone(),
                    publish,
                };
                delivery.handle_payload(&topic, &mut payload, ack);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                stats.set_mqtt_connected(false);
                tracing::warn!("disconnected from MQTT server");
            }
            Ok(_) => {}
            Err(err) => {
                stats.set_mqtt_connected(false);
                tracing::warn!(error = %err, pending = delivery.pending(), "MQTT connection dropped; reconnecting");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    delivery.shutdown().await;
    if let Err(err) = client.try_disconnect() {
        tracing::debug!(error = %err, "failed to queue MQTT disconnect");
    }
    Ok(())
}
