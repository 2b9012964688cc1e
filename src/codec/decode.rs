//! MQTT Packet Decoder
//!
//! Decodes the client packet set for both v3.1.1 and v5.0

use bytes::Bytes;

use super::{
    read_binary, read_string, read_u16, read_variable_int, skip_properties,
    DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Disconnect, Packet, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe, Subscription,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum packet size
    max_packet_size: usize,
    /// Protocol version of the session (a decoded CONNECT overrides it)
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            protocol_version: ProtocolVersion::V311,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Decode a packet from the buffer
    /// Returns Ok(None) until a complete packet is buffered
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, body)?,
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => Packet::PubAck(PubAck {
                packet_id: Self::decode_ack(flags, 0x00, body)?,
            }),
            5 => Packet::PubRec(PubRec {
                packet_id: Self::decode_ack(flags, 0x00, body)?,
            }),
            6 => Packet::PubRel(PubRel {
                packet_id: Self::decode_ack(flags, 0x02, body)?,
            }),
            7 => Packet::PubComp(PubComp {
                packet_id: Self::decode_ack(flags, 0x00, body)?,
            }),
            8 => self.decode_subscribe(flags, body)?,
            9 => self.decode_suback(flags, body)?,
            12 | 13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if packet_type == 12 {
                    Packet::PingReq
                } else {
                    Packet::PingResp
                }
            }
            14 => self.decode_disconnect(flags, body)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&mut self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;
        let (protocol_name, len) = read_string(payload)?;
        pos += len;
        if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
            return Err(DecodeError::InvalidProtocolName);
        }

        let version_byte = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        let protocol_version = match version_byte {
            3 | 4 => ProtocolVersion::V311,
            5 => ProtocolVersion::V5,
            _ => return Err(DecodeError::InvalidProtocolVersion(version_byte)),
        };
        self.protocol_version = protocol_version;

        let connect_flags = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let clean_start = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        let keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        if protocol_version == ProtocolVersion::V5 {
            pos += skip_properties(&payload[pos..])?;
        }

        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        // Will messages are accepted on the wire but never used by a relay
        if will_flag {
            if protocol_version == ProtocolVersion::V5 {
                pos += skip_properties(&payload[pos..])?;
            }
            let (_, len) = read_string(&payload[pos..])?;
            pos += len;
            let (_, len) = read_binary(&payload[pos..])?;
            pos += len;
        }

        let username = if username_flag {
            let (username, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(username.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (password, _) = read_binary(&payload[pos..])?;
            Some(Bytes::copy_from_slice(password))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_start,
            keep_alive,
            username,
            password,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let acknowledge_flags = payload[0];
        // Only bit 0 is valid (session present)
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code: ConnectReturnCode(payload[1]),
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(payload)?;
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        if self.is_v5() {
            pos += skip_properties(&payload[pos..])?;
        }

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    /// PUBACK / PUBREC / PUBREL / PUBCOMP: packet id, then an optional
    /// v5.0 reason code and property block that a relay ignores.
    fn decode_ack(flags: u8, expected_flags: u8, payload: &[u8]) -> Result<u16, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }
        read_u16(payload)
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let mut pos = 2;
        if self.is_v5() {
            pos += skip_properties(&payload[pos..])?;
        }

        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            let options = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            let qos_bits = options & 0x03;
            let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must contain at least one filter",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let mut pos = 2;
        if self.is_v5() {
            pos += skip_properties(&payload[pos..])?;
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes: payload[pos..].to_vec(),
        }))
    }

    fn decode_disconnect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let reason_code = if self.is_v5() {
            payload.first().copied().unwrap_or(0x00)
        } else {
            0x00
        };

        Ok(Packet::Disconnect(Disconnect { reason_code }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
