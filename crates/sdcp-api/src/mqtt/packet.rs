// ── MQTT 3.1.1 wire codec ──
//
// Just enough of the protocol for a single-process broker: CONNECT,
// CONNACK, PUBLISH (QoS 0/1), PUBACK, SUBSCRIBE, SUBACK, UNSUBSCRIBE,
// UNSUBACK, PINGREQ, PINGRESP, DISCONNECT. The decoder is a
// `tokio_util::codec::Decoder`, so TCP chunking (partial or merged
// packets) is absorbed by the buffer and never reaches the broker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Largest remaining length representable in four varint bytes.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default ceiling on one whole packet, fixed header included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

// ── Packet types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, topics: Vec<(String, u8)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    Unsubscribe { packet_id: u16, topics: Vec<String> },
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
    /// Any control packet the broker does not act on (PUBREC, AUTH, ...).
    Other { packet_type: u8 },
}

/// A decoded packet plus its exact bytes on the wire, so the broker can
/// fan a PUBLISH out verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet: Packet,
    pub raw: Bytes,
}

// ── Variable-length integers ─────────────────────────────────────────

/// Append the MQTT "remaining length" encoding of `len`.
pub fn write_remaining_length(mut len: usize, dst: &mut BytesMut) -> Result<(), Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::Protocol(format!("remaining length {len} too large")));
    }
    loop {
        let mut byte = u8::try_from(len % 128).unwrap_or_default();
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining length from the start of `src`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value
/// and the number of bytes it occupied.
pub fn read_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in src.iter().enumerate() {
        if i >= 4 {
            return Err(Error::Protocol("remaining length exceeds four bytes".into()));
        }
        value += usize::from(byte & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if src.len() >= 4 {
        return Err(Error::Protocol("remaining length exceeds four bytes".into()));
    }
    Ok(None)
}

// ── Field helpers ────────────────────────────────────────────────────

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), Error> {
    if buf.remaining() < n {
        return Err(Error::Protocol(format!("truncated {what}")));
    }
    Ok(())
}

fn get_u16(buf: &mut Bytes, what: &str) -> Result<u16, Error> {
    need(buf, 2, what)?;
    Ok(buf.get_u16())
}

fn get_binary(buf: &mut Bytes, what: &str) -> Result<Bytes, Error> {
    let len = usize::from(get_u16(buf, what)?);
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes, what: &str) -> Result<String, Error> {
    let raw = get_binary(buf, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol(format!("{what} is not UTF-8")))
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), Error> {
    let len = u16::try_from(s.len()).map_err(|_| Error::Protocol("string too long".into()))?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

// ── Body decoding ────────────────────────────────────────────────────

fn decode_connect(mut body: Bytes) -> Result<Packet, Error> {
    let protocol_name = get_string(&mut body, "protocol name")?;
    need(&body, 4, "connect header")?;
    let protocol_level = body.get_u8();
    let flags = body.get_u8();
    let keep_alive = body.get_u16();
    let client_id = get_string(&mut body, "client id")?;

    if flags & 0x04 != 0 {
        // Will topic and message are accepted and ignored.
        get_binary(&mut body, "will topic")?;
        get_binary(&mut body, "will message")?;
    }
    let username = if flags & 0x80 != 0 {
        Some(get_string(&mut body, "username")?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(get_binary(&mut body, "password")?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        username,
        password,
    }))
}

fn decode_publish(flags: u8, mut body: Bytes) -> Result<Packet, Error> {
    let qos = (flags >> 1) & 0x03;
    if qos > 2 {
        return Err(Error::Protocol("invalid QoS 3".into()));
    }
    let topic = get_string(&mut body, "topic")?;
    let packet_id = if qos > 0 {
        Some(get_u16(&mut body, "packet id")?)
    } else {
        None
    };
    Ok(Packet::Publish(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: body,
    }))
}

fn decode_subscribe(mut body: Bytes) -> Result<Packet, Error> {
    let packet_id = get_u16(&mut body, "packet id")?;
    let mut topics = Vec::new();
    while body.has_remaining() {
        let topic = get_string(&mut body, "topic filter")?;
        need(&body, 1, "requested QoS")?;
        topics.push((topic, body.get_u8() & 0x03));
    }
    if topics.is_empty() {
        return Err(Error::Protocol("SUBSCRIBE without topics".into()));
    }
    Ok(Packet::Subscribe { packet_id, topics })
}

fn decode_unsubscribe(mut body: Bytes) -> Result<Packet, Error> {
    let packet_id = get_u16(&mut body, "packet id")?;
    let mut topics = Vec::new();
    while body.has_remaining() {
        topics.push(get_string(&mut body, "topic filter")?);
    }
    Ok(Packet::Unsubscribe { packet_id, topics })
}

fn decode_body(header: u8, mut body: Bytes) -> Result<Packet, Error> {
    let packet_type = header >> 4;
    let flags = header & 0x0f;
    Ok(match packet_type {
        1 => decode_connect(body)?,
        2 => {
            need(&body, 2, "connack")?;
            let ack_flags = body.get_u8();
            Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code: body.get_u8(),
            }
        }
        3 => decode_publish(flags, body)?,
        4 => Packet::PubAck {
            packet_id: get_u16(&mut body, "puback")?,
        },
        8 => decode_subscribe(body)?,
        9 => {
            let packet_id = get_u16(&mut body, "suback")?;
            Packet::SubAck {
                packet_id,
                codes: body.to_vec(),
            }
        }
        10 => decode_unsubscribe(body)?,
        11 => Packet::UnsubAck {
            packet_id: get_u16(&mut body, "unsuback")?,
        },
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect,
        0 => return Err(Error::Protocol("reserved packet type 0".into())),
        other => Packet::Other { packet_type: other },
    })
}

// ── Codec ────────────────────────────────────────────────────────────

/// Framing codec; all buffering lives in the `BytesMut`. Packets larger
/// than `max_packet_size` are refused before any buffer space is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for MqttCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let Some((remaining, len_bytes)) = read_remaining_length(&src[1..])? else {
            return Ok(None);
        };
        let total = 1 + len_bytes + remaining;
        if total > self.max_packet_size {
            return Err(Error::Protocol(format!(
                "packet of {total} bytes exceeds the {} byte limit",
                self.max_packet_size
            )));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        let header = raw[0];
        let body = raw.slice(1 + len_bytes..);
        let packet = decode_body(header, body)?;
        Ok(Some(Frame { packet, raw }))
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        packet.encode(dst)
    }
}

impl Packet {
    /// Serialize into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        let header: u8 = match self {
            Self::Connect(c) => {
                put_string(&mut body, &c.protocol_name)?;
                body.put_u8(c.protocol_level);
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if c.password.is_some() {
                    flags |= 0x40;
                }
                if c.username.is_some() {
                    flags |= 0x80;
                }
                body.put_u8(flags);
                body.put_u16(c.keep_alive);
                put_string(&mut body, &c.client_id)?;
                if let Some(user) = &c.username {
                    put_string(&mut body, user)?;
                }
                if let Some(pass) = &c.password {
                    let len = u16::try_from(pass.len())
                        .map_err(|_| Error::Protocol("password too long".into()))?;
                    body.put_u16(len);
                    body.put_slice(pass);
                }
                0x10
            }
            Self::ConnAck {
                session_present,
                code,
            } => {
                body.put_u8(u8::from(*session_present));
                body.put_u8(*code);
                0x20
            }
            Self::Publish(p) => {
                put_string(&mut body, &p.topic)?;
                if let Some(id) = p.packet_id {
                    body.put_u16(id);
                }
                body.put_slice(&p.payload);
                0x30 | (u8::from(p.dup) << 3) | ((p.qos & 0x03) << 1) | u8::from(p.retain)
            }
            Self::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                0x40
            }
            Self::Subscribe { packet_id, topics } => {
                body.put_u16(*packet_id);
                for (topic, qos) in topics {
                    put_string(&mut body, topic)?;
                    body.put_u8(*qos);
                }
                0x82
            }
            Self::SubAck { packet_id, codes } => {
                body.put_u16(*packet_id);
                body.put_slice(codes);
                0x90
            }
            Self::Unsubscribe { packet_id, topics } => {
                body.put_u16(*packet_id);
                for topic in topics {
                    put_string(&mut body, topic)?;
                }
                0xa2
            }
            Self::UnsubAck { packet_id } => {
                body.put_u16(*packet_id);
                0xb0
            }
            Self::PingReq => 0xc0,
            Self::PingResp => 0xd0,
            Self::Disconnect => 0xe0,
            Self::Other { packet_type } => packet_type << 4,
        };

        dst.put_u8(header);
        write_remaining_length(body.len(), dst)?;
        dst.extend_from_slice(&body);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn publish(topic: &str, payload: &[u8], qos: u8) -> Packet {
        Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: (qos > 0).then_some(42),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    #[test]
    fn remaining_length_boundaries() {
        for (value, expected) in [
            (0usize, vec![0x00]),
            (127, vec![0x7f]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xff, 0x7f]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xff, 0xff, 0xff, 0x7f]),
        ] {
            let mut buf = BytesMut::new();
            write_remaining_length(value, &mut buf).unwrap();
            assert_eq!(buf.to_vec(), expected, "encoding {value}");
            assert_eq!(
                read_remaining_length(&expected).unwrap(),
                Some((value, expected.len()))
            );
        }
    }

    #[test]
    fn remaining_length_rejects_fifth_byte() {
        assert!(read_remaining_length(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
        let mut buf = BytesMut::new();
        assert!(write_remaining_length(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
    }

    #[test]
    fn remaining_length_incomplete() {
        assert_eq!(read_remaining_length(&[0x80]).unwrap(), None);
        assert_eq!(read_remaining_length(&[]).unwrap(), None);
    }

    #[test]
    fn publish_split_mid_payload_is_reassembled() {
        let payload = vec![b'x'; 300];
        let wire = publish("/sdcp/status/MB1", &payload, 0).to_bytes().unwrap();
        let (first, second) = wire.split_at(wire.len() / 2 + 7);

        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(first);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(second);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.raw, wire);
        let Packet::Publish(p) = frame.packet else {
            panic!("expected publish");
        };
        assert_eq!(p.topic, "/sdcp/status/MB1");
        assert_eq!(p.payload.len(), 300);
        assert!(buf.is_empty());
    }

    #[test]
    fn merged_packets_decode_one_at_a_time() {
        let mut buf = BytesMut::new();
        publish("a", b"1", 1).encode(&mut buf).unwrap();
        Packet::PingReq.encode(&mut buf).unwrap();
        publish("b", b"2", 0).encode(&mut buf).unwrap();

        let mut codec = MqttCodec::default();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first.packet, Packet::Publish(ref p) if p.packet_id == Some(42)));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().packet, Packet::PingReq);
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap().packet,
            Packet::Publish(ref p) if p.topic == "b"
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn connect_with_credentials() {
        let connect = Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: "client-1".into(),
            username: Some("elegoo".into()),
            password: Some(Bytes::from_static(b"123456")),
        });
        let mut buf = BytesMut::from(&connect.to_bytes().unwrap()[..]);
        let frame = MqttCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.packet, connect);
    }

    #[test]
    fn oversized_packet_is_refused_from_its_header() {
        // PUBLISH claiming the largest remaining length, with no payload yet.
        let mut buf = BytesMut::from(&[0x30, 0xff, 0xff, 0xff, 0x7f][..]);
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(Error::Protocol(_))
        ));
        assert!(buf.capacity() < DEFAULT_MAX_PACKET_SIZE, "nothing was reserved");

        let wire = publish("t", &[0u8; 64], 0).to_bytes().unwrap();
        let mut small = MqttCodec::new(32);
        assert!(small.decode(&mut BytesMut::from(&wire[..])).is_err());
        let mut roomy = MqttCodec::new(wire.len());
        assert!(roomy.decode(&mut BytesMut::from(&wire[..])).unwrap().is_some());
    }

    #[test]
    fn subscribe_without_topics_is_a_protocol_error() {
        // SUBSCRIBE, remaining length 2, packet id 1, no filters.
        let mut buf = BytesMut::from(&[0x82, 0x02, 0x00, 0x01][..]);
        assert!(matches!(MqttCodec::default().decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn fixed_header_only_packets() {
        assert_eq!(Packet::PingResp.to_bytes().unwrap().to_vec(), vec![0xd0, 0x00]);
        assert_eq!(
            Packet::ConnAck {
                session_present: false,
                code: 0
            }
            .to_bytes()
            .unwrap()
            .to_vec(),
            vec![0x20, 0x02, 0x00, 0x00]
        );
    }
}
