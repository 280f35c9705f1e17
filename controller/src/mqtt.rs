use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use tracing::{debug, error, info, warn};

use doser_common::{
    DoseTopics, InboundTopic, PumpActivity, PumpCommand, PumpId, RuntimeConfig,
    ScheduleAddRequest, ScheduleDeleteRequest, ScheduleStore,
};

use crate::{app::AppState, connectivity::RetryDecision};

pub fn mqtt_options(config: &RuntimeConfig, topics: &DoseTopics) -> MqttOptions {
    let network = &config.network;
    let mut options = MqttOptions::new(
        format!("doser-{}", config.device_id),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(network.keep_alive_s));
    options.set_last_will(LastWill::new(topics.online(), "false", QoS::AtLeastOnce, true));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    options
}

/// Outbound side of the bus. Every publish is queued without waiting and is
/// skipped entirely while the link is down.
#[derive(Clone)]
pub struct Telemetry {
    client: AsyncClient,
    topics: Arc<DoseTopics>,
    connected: Arc<AtomicBool>,
    heartbeat_payload: Arc<str>,
}

impl Telemetry {
    pub fn new(client: AsyncClient, topics: DoseTopics, heartbeat_payload: &str) -> Self {
        Self {
            client,
            topics: Arc::new(topics),
            connected: Arc::new(AtomicBool::new(false)),
            heartbeat_payload: Arc::from(heartbeat_payload),
        }
    }

    pub fn topics(&self) -> &DoseTopics {
        &self.topics
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Vec<u8>) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.client.try_publish(topic.clone(), qos, retain, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!("publish to {topic} failed: {err}");
                false
            }
        }
    }

    pub fn publish_pump(&self, pump: PumpId, activity: PumpActivity) {
        self.publish(
            self.topics.pump_status(pump),
            QoS::AtLeastOnce,
            true,
            activity.as_str().as_bytes().to_vec(),
        );
    }

    pub fn publish_schedules(&self, schedules: &ScheduleStore) {
        self.publish(
            self.topics.schedules(),
            QoS::AtLeastOnce,
            true,
            schedules.to_value().to_string().into_bytes(),
        );
    }

    pub fn publish_online(&self) {
        self.publish(
            self.topics.online(),
            QoS::AtLeastOnce,
            true,
            b"true".to_vec(),
        );
    }

    pub fn heartbeat(&self) {
        self.publish(
            self.topics.heartbeat(),
            QoS::AtMostOnce,
            false,
            self.heartbeat_payload.as_bytes().to_vec(),
        );
    }

    /// Log lines never warn on failure; that would feed the log queue itself.
    pub fn publish_log(&self, line: &str) {
        if !self.is_connected() {
            return;
        }
        if let Err(err) = self.client.try_publish(
            self.topics.log(),
            QoS::AtMostOnce,
            false,
            line.as_bytes().to_vec(),
        ) {
            debug!("log publish dropped: {err}");
        }
    }
}

/// Queued without waiting: this runs inside the task that drains the queue.
pub fn subscribe_topics(telemetry: &Telemetry) -> anyhow::Result<()> {
    for topic in telemetry.topics().subscriptions() {
        telemetry
            .client()
            .try_subscribe(topic.clone(), QoS::AtMostOnce)
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    Ok(())
}

pub fn spawn_mqtt_loop(app_state: AppState, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    app_state.telemetry.set_connected(true);
                    app_state.link.lock().await.on_connected();
                    if let Err(err) = subscribe_topics(&app_state.telemetry) {
                        warn!("mqtt resubscribe failed: {err:#}");
                    }
                    app_state.telemetry.publish_online();
                    app_state.publish_all().await;
                    app_state.request_redraw().await;
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    app_state.telemetry.set_connected(false);
                    app_state.link.lock().await.on_disconnected();
                    app_state.request_redraw().await;
                }
                Ok(_) => {}
                Err(err) => {
                    let was_connected = app_state.telemetry.is_connected();
                    app_state.telemetry.set_connected(false);
                    let decision = app_state.link.lock().await.on_failure();
                    if was_connected {
                        app_state.request_redraw().await;
                    }
                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            warn!("mqtt poll error: {err}; retrying in {}s", delay.as_secs());
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Escalate => {
                            let delay = app_state.config.doser.mqtt_reconnect_delay_ms;
                            error!("mqtt unreachable after repeated attempts ({err}); pausing {delay}ms");
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                    }
                }
            }
        }
    });
}

pub async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    let max_payload = app_state.config.doser.max_payload_bytes;
    if payload.len() > max_payload {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
    let Some(inbound) = app_state.telemetry.topics().classify(topic) else {
        debug!("ignoring message on unrelated topic {topic}");
        return Ok(());
    };

    match inbound {
        InboundTopic::PumpCommand(pump) => {
            let command = PumpCommand::parse(message)
                .with_context(|| format!("rejected command for {pump}"))?;
            app_state.pump_command(pump, command).await;
        }
        InboundTopic::ScheduleAdd => {
            let request = ScheduleAddRequest::parse(message).context("rejected schedule add")?;
            if let Err(err) = app_state.add_schedule(request.pump, request.entry).await {
                warn!("SCHED: add rejected: {err}");
            }
        }
        InboundTopic::ScheduleDelete => {
            let request =
                ScheduleDeleteRequest::parse(message).context("rejected schedule delete")?;
            if let Err(err) = app_state
                .delete_schedule(request.pump, request.hour, request.minute)
                .await
            {
                warn!("SCHED: delete ignored: {err}");
            }
        }
        InboundTopic::RequestStatus => {
            info!("status requested");
            app_state.publish_all().await;
        }
    }
    Ok(())
}
