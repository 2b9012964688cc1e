//! MQTT over TCP
//!
//! Dials the broker, performs the CONNECT/CONNACK handshake and then hands
//! the socket to a session task that multiplexes queued commands, inbound
//! packets and the keep alive timer.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, trace, warn};

use super::{ConnectOptions, Session, SessionCommand, SessionDriver, SessionEvent, Transport, TransportError};
use crate::codec::{Decoder, Encoder};
use crate::message::Message;
use crate::protocol::{
    ConnAck, Connect, Disconnect, Packet, PubAck, PubComp, PubRec, PubRel, QoS, Subscribe,
    Subscription,
};

/// MQTT client transport over plain TCP
#[derive(Debug, Default, Clone)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Session, TransportError> {
        options.validate()?;

        let address = options.address();
        let stream = timeout(options.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionLost(format!("{}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);

        let mut io = SessionIo::new(stream, options);
        let connack = timeout(options.connect_timeout, io.handshake(options))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if !connack.return_code.is_success() {
            return Err(TransportError::Rejected(connack.return_code));
        }

        debug!(
            "{}: CONNACK accepted (session_present={})",
            options.client_id, connack.session_present
        );

        let (session, driver) = Session::pair(connack.session_present);
        tokio::spawn(io.run(driver));
        Ok(session)
    }
}

/// Socket side of one session
struct SessionIo {
    client_id: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
    keepalive: Duration,
    next_packet_id: u16,
    awaiting_pingresp: bool,
    /// Inbound QoS 2 packet ids delivered but not yet released
    awaiting_rel: HashSet<u16>,
}

impl SessionIo {
    fn new(stream: TcpStream, options: &ConnectOptions) -> Self {
        let (reader, writer) = stream.into_split();
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(options.protocol_version);

        Self {
            client_id: options.client_id.clone(),
            reader,
            writer,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
            encoder: Encoder::new(options.protocol_version),
            decoder,
            keepalive: options.keepalive,
            next_packet_id: 0,
            awaiting_pingresp: false,
            awaiting_rel: HashSet::new(),
        }
    }

    async fn handshake(&mut self, options: &ConnectOptions) -> Result<ConnAck, TransportError> {
        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: options.protocol_version,
            client_id: options.client_id.clone(),
            clean_start: options.clean_session,
            keep_alive: options.keepalive.as_secs().min(u16::MAX as u64) as u16,
            username: options.username.clone(),
            password: options.password.clone(),
        }));
        self.send(&connect).await?;
        debug!("{}: CONNECT sent", self.client_id);

        match self.read_packet().await? {
            Packet::ConnAck(connack) => Ok(connack),
            other => Err(TransportError::Protocol(format!(
                "expected CONNACK, got packet type {}",
                other.packet_type()
            ))),
        }
    }

    /// Read until one complete packet is buffered
    async fn read_packet(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some((packet, consumed)) = self
                .decoder
                .decode(&self.read_buf)
                .map_err(|e| TransportError::Protocol(e.to_string()))?
            {
                self.read_buf.advance(consumed);
                return Ok(packet);
            }

            let n = self
                .reader
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
            if n == 0 {
                return Err(TransportError::ConnectionLost(
                    "connection closed by broker".to_string(),
                ));
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    async fn run(mut self, mut driver: SessionDriver) {
        let reason = match self.drive(&mut driver).await {
            Ok(()) => None,
            Err(e) => {
                debug!("{}: session ended: {}", self.client_id, e);
                Some(e.to_string())
            }
        };
        let _ = driver.events.send(SessionEvent::Closed(reason)).await;
    }

    /// Handle every complete packet already in the read buffer
    async fn process_buffered(
        &mut self,
        events: &mpsc::Sender<SessionEvent>,
    ) -> Result<(), TransportError> {
        while let Some((packet, consumed)) = self
            .decoder
            .decode(&self.read_buf)
            .map_err(|e| TransportError::Protocol(e.to_string()))?
        {
            self.read_buf.advance(consumed);
            self.handle_packet(packet, events).await?;
        }
        Ok(())
    }

    async fn drive(&mut self, driver: &mut SessionDriver) -> Result<(), TransportError> {
        let keepalive_enabled = !self.keepalive.is_zero();
        let mut ping = interval(self.keepalive.max(Duration::from_secs(1)));
        ping.reset();

        // Packets that arrived behind CONNACK
        self.process_buffered(&driver.events).await?;

        loop {
            tokio::select! {
                command = driver.commands.recv() => {
                    match command {
                        Some(SessionCommand::Publish(message)) => {
                            self.publish(message).await?;
                        }
                        Some(SessionCommand::Subscribe { filter, qos }) => {
                            let packet_id = self.next_packet_id();
                            let subscribe = Packet::Subscribe(Subscribe {
                                packet_id,
                                subscriptions: vec![Subscription { filter, qos }],
                            });
                            self.send(&subscribe).await?;
                        }
                        Some(SessionCommand::Disconnect) | None => {
                            let _ = self.send(&Packet::Disconnect(Disconnect::default())).await;
                            let _ = self.writer.shutdown().await;
                            return Ok(());
                        }
                    }
                }

                result = self.reader.read_buf(&mut self.read_buf) => {
                    let n = result.map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(TransportError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }

                    self.process_buffered(&driver.events).await?;
                }

                _ = ping.tick(), if keepalive_enabled => {
                    if self.awaiting_pingresp {
                        return Err(TransportError::ConnectionLost(
                            "keep alive timeout".to_string(),
                        ));
                    }
                    self.send(&Packet::PingReq).await?;
                    self.awaiting_pingresp = true;
                    trace!("{}: PINGREQ sent", self.client_id);
                }
            }
        }
    }

    async fn publish(&mut self, message: Message) -> Result<(), TransportError> {
        let packet_id = match message.qos {
            QoS::AtMostOnce => None,
            _ => Some(self.next_packet_id()),
        };
        self.send(&Packet::Publish(message.to_publish(packet_id))).await
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        events: &mpsc::Sender<SessionEvent>,
    ) -> Result<(), TransportError> {
        match packet {
            Packet::Publish(publish) => {
                let packet_id = publish.packet_id;
                let qos = publish.qos;

                let deliver = match (qos, packet_id) {
                    (QoS::ExactlyOnce, Some(id)) => self.awaiting_rel.insert(id),
                    _ => true,
                };
                if deliver {
                    events
                        .send(SessionEvent::Message(Message::from(publish)))
                        .await
                        .map_err(|_| {
                            TransportError::ConnectionLost("session receiver dropped".to_string())
                        })?;
                }

                match (qos, packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.send(&Packet::PubAck(PubAck { packet_id })).await?;
                    }
                    (QoS::ExactlyOnce, Some(packet_id)) => {
                        self.send(&Packet::PubRec(PubRec { packet_id })).await?;
                    }
                    _ => {}
                }
            }
            Packet::PubRel(PubRel { packet_id }) => {
                self.awaiting_rel.remove(&packet_id);
                self.send(&Packet::PubComp(PubComp { packet_id })).await?;
            }
            Packet::PubRec(PubRec { packet_id }) => {
                self.send(&Packet::PubRel(PubRel { packet_id })).await?;
            }
            Packet::PubAck(PubAck { packet_id }) | Packet::PubComp(PubComp { packet_id }) => {
                trace!("{}: delivery {} acknowledged", self.client_id, packet_id);
            }
            Packet::SubAck(suback) => {
                if suback.all_granted() {
                    debug!(
                        "{}: SUBACK {} granted {:?}",
                        self.client_id, suback.packet_id, suback.return_codes
                    );
                } else {
                    warn!(
                        "{}: broker refused subscription {} ({:?})",
                        self.client_id, suback.packet_id, suback.return_codes
                    );
                }
            }
            Packet::PingResp => {
                self.awaiting_pingresp = false;
                trace!("{}: PINGRESP received", self.client_id);
            }
            Packet::Disconnect(disconnect) => {
                return Err(TransportError::ConnectionLost(format!(
                    "broker sent DISCONNECT (reason 0x{:02X})",
                    disconnect.reason_code
                )));
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected packet type {} from broker",
                    other.packet_type()
                )));
            }
        }
        Ok(())
    }
}
