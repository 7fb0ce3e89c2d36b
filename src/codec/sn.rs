//! MQTT-SN message codec
//!
//! Hand-rolled the same way as `codec::coap`: no third-party MQTT-SN crate
//! exists in this stack. Each message is length-prefixed (one byte, or
//! `0x01` followed by a big-endian `u16` when the body doesn't fit in a
//! byte), per the MQTT-SN 1.2 wire format.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::QoS;

const MSG_ADVERTISE: u8 = 0x00;
const MSG_CONNECT: u8 = 0x04;
const MSG_CONNACK: u8 = 0x05;
const MSG_REGISTER: u8 = 0x0A;
const MSG_REGACK: u8 = 0x0B;
const MSG_PUBLISH: u8 = 0x0C;
const MSG_PUBACK: u8 = 0x0D;
const MSG_SUBSCRIBE: u8 = 0x12;
const MSG_SUBACK: u8 = 0x13;
const MSG_UNSUBSCRIBE: u8 = 0x14;
const MSG_UNSUBACK: u8 = 0x15;
const MSG_PINGREQ: u8 = 0x16;
const MSG_PINGRESP: u8 = 0x17;
const MSG_DISCONNECT: u8 = 0x18;

/// Topic id encoding carried in the flags byte of PUBLISH/SUBSCRIBE/etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicIdType {
    Normal,
    PreDefined,
    ShortName,
}

impl TopicIdType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => Self::PreDefined,
            0b10 => Self::ShortName,
            _ => Self::Normal,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Normal => 0b00,
            Self::PreDefined => 0b01,
            Self::ShortName => 0b10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnFlags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl SnFlags {
    fn decode(byte: u8) -> Self {
        let qos_bits = (byte >> 5) & 0x03;
        let qos = match qos_bits {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        };
        Self {
            dup: byte & 0x80 != 0,
            qos,
            retain: byte & 0x10 != 0,
            will: byte & 0x08 != 0,
            clean_session: byte & 0x04 != 0,
            topic_id_type: TopicIdType::from_bits(byte),
        }
    }

    fn encode(self) -> u8 {
        let mut byte = 0u8;
        if self.dup {
            byte |= 0x80;
        }
        byte |= (self.qos as u8 & 0x03) << 5;
        if self.retain {
            byte |= 0x10;
        }
        if self.will {
            byte |= 0x08;
        }
        if self.clean_session {
            byte |= 0x04;
        }
        byte |= self.topic_id_type.to_bits();
        byte
    }
}

impl Default for SnFlags {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            will: false,
            clean_session: true,
            topic_id_type: TopicIdType::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnMessage {
    Advertise { gw_id: u8, duration: u16 },
    Connect { flags: SnFlags, duration: u16, client_id: String },
    ConnAck { return_code: u8 },
    Register { topic_id: u16, msg_id: u16, topic_name: String },
    RegAck { topic_id: u16, msg_id: u16, return_code: u8 },
    Publish { flags: SnFlags, topic_id: u16, msg_id: u16, data: Bytes },
    PubAck { topic_id: u16, msg_id: u16, return_code: u8 },
    Subscribe { flags: SnFlags, msg_id: u16, topic: SnTopic },
    SubAck { flags: SnFlags, topic_id: u16, msg_id: u16, return_code: u8 },
    Unsubscribe { msg_id: u16, topic: SnTopic },
    UnsubAck { msg_id: u16 },
    PingReq { client_id: Option<String> },
    PingResp,
    Disconnect { duration: Option<u16> },
}

/// A SUBSCRIBE/UNSUBSCRIBE target: either a full topic name or a
/// pre-registered/short-name topic id, distinguished by `SnFlags::topic_id_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnTopic {
    Name(String),
    Id(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnDecodeError {
    TooShort,
    UnknownMessageType(u8),
    InvalidUtf8,
    LengthMismatch,
}

impl fmt::Display for SnDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "message shorter than its declared length"),
            Self::UnknownMessageType(t) => write!(f, "unknown MQTT-SN message type: 0x{:02x}", t),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in topic name or client id"),
            Self::LengthMismatch => write!(f, "declared length does not match buffer"),
        }
    }
}

impl std::error::Error for SnDecodeError {}

impl SnMessage {
    /// Decode exactly one length-prefixed message from `buf`. MQTT-SN is
    /// datagram-framed (one message per UDP packet), so the whole buffer is
    /// expected to be a single message.
    pub fn decode(buf: &[u8]) -> Result<Self, SnDecodeError> {
        if buf.is_empty() {
            return Err(SnDecodeError::TooShort);
        }
        let (total_len, header_len) = if buf[0] == 0x01 {
            if buf.len() < 3 {
                return Err(SnDecodeError::TooShort);
            }
            (u16::from_be_bytes([buf[1], buf[2]]) as usize, 3)
        } else {
            (buf[0] as usize, 1)
        };
        if total_len != buf.len() {
            return Err(SnDecodeError::LengthMismatch);
        }
        if buf.len() < header_len + 1 {
            return Err(SnDecodeError::TooShort);
        }
        let msg_type = buf[header_len];
        let body = &buf[header_len + 1..];
        Self::decode_body(msg_type, body)
    }

    fn decode_body(msg_type: u8, body: &[u8]) -> Result<Self, SnDecodeError> {
        let u16_at = |b: &[u8], i: usize| -> Result<u16, SnDecodeError> {
            if b.len() < i + 2 {
                return Err(SnDecodeError::TooShort);
            }
            Ok(u16::from_be_bytes([b[i], b[i + 1]]))
        };
        let utf8 = |b: &[u8]| -> Result<String, SnDecodeError> {
            std::str::from_utf8(b).map(|s| s.to_string()).map_err(|_| SnDecodeError::InvalidUtf8)
        };

        match msg_type {
            MSG_ADVERTISE => {
                if body.len() < 3 {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::Advertise { gw_id: body[0], duration: u16_at(body, 1)? })
            }
            MSG_CONNECT => {
                if body.len() < 4 {
                    return Err(SnDecodeError::TooShort);
                }
                let flags = SnFlags::decode(body[0]);
                let duration = u16_at(body, 2)?;
                Ok(SnMessage::Connect { flags, duration, client_id: utf8(&body[4..])? })
            }
            MSG_CONNACK => {
                if body.is_empty() {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::ConnAck { return_code: body[0] })
            }
            MSG_REGISTER => {
                if body.len() < 4 {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::Register {
                    topic_id: u16_at(body, 0)?,
                    msg_id: u16_at(body, 2)?,
                    topic_name: utf8(&body[4..])?,
                })
            }
            MSG_REGACK => {
                if body.len() < 5 {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::RegAck {
                    topic_id: u16_at(body, 0)?,
                    msg_id: u16_at(body, 2)?,
                    return_code: body[4],
                })
            }
            MSG_PUBLISH => {
                if body.len() < 5 {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::Publish {
                    flags: SnFlags::decode(body[0]),
                    topic_id: u16_at(body, 1)?,
                    msg_id: u16_at(body, 3)?,
                    data: Bytes::copy_from_slice(&body[5..]),
                })
            }
            MSG_PUBACK => {
                if body.len() < 5 {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::PubAck {
                    topic_id: u16_at(body, 0)?,
                    msg_id: u16_at(body, 2)?,
                    return_code: body[4],
                })
            }
            MSG_SUBSCRIBE => {
                if body.len() < 3 {
                    return Err(SnDecodeError::TooShort);
                }
                let flags = SnFlags::decode(body[0]);
                let msg_id = u16_at(body, 1)?;
                let topic = if flags.topic_id_type == TopicIdType::Normal {
                    SnTopic::Name(utf8(&body[3..])?)
                } else {
                    SnTopic::Id(u16_at(body, 3)?)
                };
                Ok(SnMessage::Subscribe { flags, msg_id, topic })
            }
            MSG_SUBACK => {
                if body.len() < 6 {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::SubAck {
                    flags: SnFlags::decode(body[0]),
                    topic_id: u16_at(body, 1)?,
                    msg_id: u16_at(body, 3)?,
                    return_code: body[5],
                })
            }
            MSG_UNSUBSCRIBE => {
                if body.len() < 3 {
                    return Err(SnDecodeError::TooShort);
                }
                let flags = SnFlags::decode(body[0]);
                let msg_id = u16_at(body, 1)?;
                let topic = if flags.topic_id_type == TopicIdType::Normal {
                    SnTopic::Name(utf8(&body[3..])?)
                } else {
                    SnTopic::Id(u16_at(body, 3)?)
                };
                Ok(SnMessage::Unsubscribe { msg_id, topic })
            }
            MSG_UNSUBACK => {
                if body.len() < 2 {
                    return Err(SnDecodeError::TooShort);
                }
                Ok(SnMessage::UnsubAck { msg_id: u16_at(body, 0)? })
            }
            MSG_PINGREQ => {
                if body.is_empty() {
                    Ok(SnMessage::PingReq { client_id: None })
                } else {
                    Ok(SnMessage::PingReq { client_id: Some(utf8(body)?) })
                }
            }
            MSG_PINGRESP => Ok(SnMessage::PingResp),
            MSG_DISCONNECT => {
                if body.len() >= 2 {
                    Ok(SnMessage::Disconnect { duration: Some(u16_at(body, 0)?) })
                } else {
                    Ok(SnMessage::Disconnect { duration: None })
                }
            }
            other => Err(SnDecodeError::UnknownMessageType(other)),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        let msg_type = match self {
            SnMessage::Advertise { gw_id, duration } => {
                body.put_u8(*gw_id);
                body.put_u16(*duration);
                MSG_ADVERTISE
            }
            SnMessage::Connect { flags, duration, client_id } => {
                body.put_u8(flags.encode());
                body.put_u8(0x01); // protocol id
                body.put_u16(*duration);
                body.put_slice(client_id.as_bytes());
                MSG_CONNECT
            }
            SnMessage::ConnAck { return_code } => {
                body.put_u8(*return_code);
                MSG_CONNACK
            }
            SnMessage::Register { topic_id, msg_id, topic_name } => {
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_slice(topic_name.as_bytes());
                MSG_REGISTER
            }
            SnMessage::RegAck { topic_id, msg_id, return_code } => {
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_u8(*return_code);
                MSG_REGACK
            }
            SnMessage::Publish { flags, topic_id, msg_id, data } => {
                body.put_u8(flags.encode());
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_slice(data);
                MSG_PUBLISH
            }
            SnMessage::PubAck { topic_id, msg_id, return_code } => {
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_u8(*return_code);
                MSG_PUBACK
            }
            SnMessage::Subscribe { flags, msg_id, topic } => {
                body.put_u8(flags.encode());
                body.put_u16(*msg_id);
                match topic {
                    SnTopic::Name(name) => body.put_slice(name.as_bytes()),
                    SnTopic::Id(id) => body.put_u16(*id),
                }
                MSG_SUBSCRIBE
            }
            SnMessage::SubAck { flags, topic_id, msg_id, return_code } => {
                body.put_u8(flags.encode());
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_u8(*return_code);
                MSG_SUBACK
            }
            SnMessage::Unsubscribe { msg_id, topic } => {
                let flags = SnFlags {
                    topic_id_type: match topic {
                        SnTopic::Name(_) => TopicIdType::Normal,
                        SnTopic::Id(_) => TopicIdType::PreDefined,
                    },
                    ..SnFlags::default()
                };
                body.put_u8(flags.encode());
                body.put_u16(*msg_id);
                match topic {
                    SnTopic::Name(name) => body.put_slice(name.as_bytes()),
                    SnTopic::Id(id) => body.put_u16(*id),
                }
                MSG_UNSUBSCRIBE
            }
            SnMessage::UnsubAck { msg_id } => {
                body.put_u16(*msg_id);
                MSG_UNSUBACK
            }
            SnMessage::PingReq { client_id } => {
                if let Some(id) = client_id {
                    body.put_slice(id.as_bytes());
                }
                MSG_PINGREQ
            }
            SnMessage::PingResp => MSG_PINGRESP,
            SnMessage::Disconnect { duration } => {
                if let Some(d) = duration {
                    body.put_u16(*d);
                }
                MSG_DISCONNECT
            }
        };

        let total_len = 1 + 1 + body.len();
        let mut out = BytesMut::with_capacity(total_len + 2);
        if total_len <= 255 {
            out.put_u8(total_len as u8);
        } else {
            out.put_u8(0x01);
            out.put_u16(total_len as u16);
        }
        out.put_u8(msg_type);
        out.put_slice(&body);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_publish() {
        let msg = SnMessage::Publish {
            flags: SnFlags { qos: QoS::AtLeastOnce, retain: true, ..SnFlags::default() },
            topic_id: 7,
            msg_id: 42,
            data: Bytes::copy_from_slice(b"23.5"),
        };
        let encoded = msg.encode();
        let decoded = SnMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_subscribe_by_name() {
        let msg = SnMessage::Subscribe {
            flags: SnFlags::default(),
            msg_id: 1,
            topic: SnTopic::Name("sensors/temp".to_string()),
        };
        let decoded = SnMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = SnMessage::PingResp.encode().to_vec();
        bytes.push(0); // trailing garbage invalidates declared length
        assert_eq!(SnMessage::decode(&bytes), Err(SnDecodeError::LengthMismatch));
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert_eq!(SnMessage::decode(&[0x02, 0xFE]), Err(SnDecodeError::UnknownMessageType(0xFE)));
    }
}
