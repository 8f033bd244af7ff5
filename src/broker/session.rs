//! Per-connection MQTT session with statum state machine
//!
//! ```text
//! AwaitingConnect ──(CONNECT accepted)──► Established ──► (disconnect / error)
//! ```
//!
//! Packet framing comes from `rumqttc::mqttbytes::v4`; this module only decides
//! what to answer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{self, matches};
use rumqttc::QoS;
use statum::{machine, state};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::auth::Authorizer;
use super::{BrokerError, BrokerEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A publish fanned out to every local session.
#[derive(Debug, Clone)]
pub struct RoutedPublish {
    pub topic: String,
    pub payload: Bytes,
}

/// Shared by all sessions of one broker.
#[derive(Clone)]
pub struct SessionContext {
    pub authorizer: Arc<dyn Authorizer>,
    pub events: mpsc::Sender<BrokerEvent>,
    pub routes: broadcast::Sender<RoutedPublish>,
    pub max_packet_size: usize,
}

impl SessionContext {
    async fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("No consumer for broker events");
        }
    }

    fn route(&self, topic: &str, payload: &Bytes) {
        // no receivers simply means no local subscribers yet
        let _ = self.routes.send(RoutedPublish {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: String,
    pub will: Option<RoutedPublish>,
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    AwaitingConnect,
    Established(ClientInfo),
}

#[machine]
pub struct Session<S: SessionState> {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    ctx: SessionContext,
}

enum Flow {
    Continue,
    Disconnect,
}

impl<S: SessionState> Session<S> {
    async fn read_packet(&mut self) -> Result<Packet, BrokerError> {
        loop {
            match v4::read(&mut self.read_buf, self.ctx.max_packet_size) {
                Ok(packet) => return Ok(packet),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(e.into()),
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(BrokerError::ConnectionClosed);
            }
        }
    }

    async fn send<F>(&mut self, encode: F) -> Result<(), BrokerError>
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    {
        self.write_buf.clear();
        encode(&mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}

impl Session<AwaitingConnect> {
    pub fn accept(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) -> Self {
        Self::new(
            stream,
            peer,
            BytesMut::with_capacity(4096),
            BytesMut::with_capacity(4096),
            ctx,
        )
    }

    /// Waits for CONNECT, runs authentication and answers with CONNACK.
    pub async fn handshake(mut self) -> Result<Session<Established>, BrokerError> {
        let packet = tokio::time::timeout(CONNECT_TIMEOUT, self.read_packet())
            .await
            .map_err(|_| BrokerError::Protocol("no CONNECT within timeout".to_string()))??;

        let connect = match packet {
            Packet::Connect(connect) => connect,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "expected CONNECT, got {:?}",
                    other
                )))
            }
        };

        let (username, password) = match &connect.login {
            Some(login) => (Some(login.username.as_str()), Some(login.password.as_str())),
            None => (None, None),
        };
        if !self
            .ctx
            .authorizer
            .authenticate(&connect.client_id, username, password)
        {
            self.send(|buf| ConnAck::new(ConnectReturnCode::NotAuthorized, false).write(buf))
                .await?;
            return Err(BrokerError::Unauthorized(connect.client_id));
        }

        let id = if connect.client_id.is_empty() {
            format!("anonymous_{}", self.peer.port())
        } else {
            connect.client_id
        };
        let will = connect.last_will.map(|will| RoutedPublish {
            topic: will.topic,
            payload: will.message,
        });

        self.send(|buf| ConnAck::new(ConnectReturnCode::Success, false).write(buf))
            .await?;

        debug!("CONNACK sent to {} ({})", id, self.peer);
        Ok(self.transition_with(ClientInfo { id, will }))
    }
}

impl Session<Established> {
    pub fn client_id(&self) -> String {
        self.get_state_data()
            .map(|info| info.id.clone())
            .unwrap_or_default()
    }

    /// Serves the client until it disconnects, the connection fails or the
    /// broker shuts down. A connection lost without DISCONNECT publishes the
    /// client's last will.
    pub async fn serve(
        mut self,
        cancel: CancellationToken,
        mut routes: broadcast::Receiver<RoutedPublish>,
    ) -> Result<(), BrokerError> {
        let Some(client) = self.get_state_data().cloned() else {
            return Err(BrokerError::Protocol("session without client".to_string()));
        };
        let mut filters: Vec<String> = Vec::new();

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(Flow::Disconnect),

                routed = routes.recv() => match routed {
                    Ok(publish) => {
                        if filters.iter().any(|filter| matches(&publish.topic, filter)) {
                            if let Err(e) = self.deliver(publish).await {
                                break Err(e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Client {} lagging, skipped {} messages", client.id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(Flow::Disconnect),
                },

                packet = self.read_packet() => {
                    let handled = match packet {
                        Ok(packet) => self.handle_packet(packet, &client, &mut filters).await,
                        Err(e) => Err(e),
                    };
                    match handled {
                        Ok(Flow::Continue) => {}
                        other => break other,
                    }
                }
            }
        };

        let graceful = matches!(outcome, Ok(Flow::Disconnect));
        if !graceful {
            if let Some(will) = &client.will {
                debug!("Publishing last will of {} on {}", client.id, will.topic);
                self.ctx.route(&will.topic, &will.payload);
                self.ctx
                    .emit(BrokerEvent::Publish {
                        topic: will.topic.clone(),
                        payload: will.payload.clone(),
                        client: None,
                    })
                    .await;
            }
        }

        match outcome {
            Ok(_) | Err(BrokerError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        client: &ClientInfo,
        filters: &mut Vec<String>,
    ) -> Result<Flow, BrokerError> {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish, client).await?,
            Packet::PubRel(release) => {
                self.send(|buf| PubComp::new(release.pkid).write(buf)).await?
            }
            Packet::Subscribe(subscribe) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| {
                        if self.ctx.authorizer.authorize_subscribe(&client.id, &filter.path) {
                            debug!("{} subscribed to {}", client.id, filter.path);
                            filters.push(filter.path.clone());
                            SubscribeReasonCode::Success(QoS::AtMostOnce)
                        } else {
                            warn!("Subscription of {} to {} denied", client.id, filter.path);
                            SubscribeReasonCode::Failure
                        }
                    })
                    .collect();
                self.send(|buf| SubAck::new(subscribe.pkid, codes).write(buf))
                    .await?
            }
            Packet::Unsubscribe(unsubscribe) => {
                filters.retain(|filter| !unsubscribe.topics.contains(filter));
                self.send(|buf| UnsubAck::new(unsubscribe.pkid).write(buf))
                    .await?
            }
            Packet::PingReq => self.send(|buf| PingResp.write(buf)).await?,
            Packet::Disconnect => return Ok(Flow::Disconnect),
            // everything routed out is QoS 0, nothing to track
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {}
            other => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected packet from {}: {:?}",
                    client.id, other
                )))
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_publish(&mut self, publish: Publish, client: &ClientInfo) -> Result<(), BrokerError> {
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => self.send(|buf| PubAck::new(publish.pkid).write(buf)).await?,
            QoS::ExactlyOnce => self.send(|buf| PubRec::new(publish.pkid).write(buf)).await?,
        }

        if !self
            .ctx
            .authorizer
            .authorize_publish(&client.id, &publish.topic)
        {
            warn!("Publish of {} on {} denied", client.id, publish.topic);
            return Ok(());
        }

        self.ctx.route(&publish.topic, &publish.payload);
        self.ctx
            .emit(BrokerEvent::Publish {
                topic: publish.topic,
                payload: publish.payload,
                client: Some(client.id.clone()),
            })
            .await;
        Ok(())
    }

    async fn deliver(&mut self, routed: RoutedPublish) -> Result<(), BrokerError> {
        let publish = Publish::new(routed.topic, QoS::AtMostOnce, routed.payload.to_vec());
        self.send(|buf| publish.write(buf)).await
    }
}
