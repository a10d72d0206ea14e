// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.

//! MQTT transport for record publication.
//!
//! Owns the rumqttc event loop in a background task and tracks connection
//! state so the coordinator can report bus health without probing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use crate::remote::traits::{Publisher, RemoteError};

pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    /// Connect to the broker and spawn the event-loop driver task.
    ///
    /// The driver runs until the client is dropped; reconnects are handled
    /// by rumqttc's internal backoff.
    pub fn connect(
        broker_host: &str,
        broker_port: u16,
        client_id: &str,
        topic: impl Into<String>,
        username: Option<(&str, &str)>,
    ) -> Self {
        let mut options = MqttOptions::new(client_id, broker_host, broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let Some((user, pass)) = username {
            options.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        let host = broker_host.to_string();

        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        flag.store(true, Ordering::Release);
                        info!(broker = %host, "MQTT connected");
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        flag.store(false, Ordering::Release);
                        warn!(broker = %host, "MQTT disconnected by broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::AcqRel) {
                            warn!(broker = %host, error = %e, "MQTT connection lost");
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client, topic: topic.into(), connected }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, payload: &str) -> Result<(), RemoteError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RemoteError::Connectivity("MQTT bus not connected".into()));
        }
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload.as_bytes())
            .await
            .map_err(|e| RemoteError::Connectivity(e.to_string()))?;
        debug!(topic = %self.topic, bytes = payload.len(), "Published record");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
