use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::AppState;
use crate::config::BridgeConfig;
use crate::handler;
use crate::regs::RegisterTable;
use crate::services::{MqttPublish, ServiceRegistry};

/// Connect to the broker and spawn the two transport tasks: one
/// draining the outbound publish queue, one polling the event loop and
/// feeding inbound telemetry to the message handler.
///
/// Writes go out with QoS 2 so a retransmitted command can never fire
/// twice on the pump.
pub fn start_mqtt(
    config: &BridgeConfig,
    app: Arc<AppState>,
    table: Arc<RegisterTable>,
    registry: Arc<ServiceRegistry>,
    mut publish_rx: mpsc::UnboundedReceiver<MqttPublish>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let mut options = MqttOptions::new("thermiq-bridge", &config.broker_host, config.broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&config.broker_user, &config.broker_pass) {
        options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let publisher = {
        let client = client.clone();
        tokio::spawn(async move {
            while let Some(msg) = publish_rx.recv().await {
                if let Err(e) = client
                    .publish(&msg.topic, QoS::ExactlyOnce, msg.retain, msg.payload)
                    .await
                {
                    tracing::warn!(topic = %msg.topic, error = %e, "publish failed (not retried)");
                }
            }
        })
    };

    let data_topic = app.topics.data.clone();
    let subscriber = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(topic = %data_topic, "Connected to broker, subscribing");
                    if let Err(e) = client.subscribe(&data_topic, QoS::AtLeastOnce).await {
                        tracing::error!(error = %e, "subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == data_topic => {
                    if let Err(e) =
                        handler::handle_message(&app, &table, &registry, &p.payload)
                    {
                        tracing::warn!(error = %e, "telemetry message rejected");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    (publisher, subscriber)
}
