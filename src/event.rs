//! Trace event record and its wire encoding.
//!
//! Probes never format into shared buffers: every `emit_event` call encodes a
//! fresh, statically bounded [`EncodedEvent`] on the stack, which the ring
//! buffer copies as one record. The consumer decodes records with
//! [`TraceEvent::decode`]; the only schema negotiation is the version byte.
//!
//! Wire layout (little endian):
//!
//! ```text
//! 0      u8   version (EVENT_VERSION)
//! 1      u8   nr_fields
//! 2      u8   payload_len
//! 3      u8   cpu_id (CPU_ID_SATURATED for ids above 254)
//! 4..8   u32  kind
//! 8..16  u64  timestamp_ns
//! 16..   u64  fields[nr_fields]
//! ..     u8   payload[payload_len]
//! ```

use core::fmt;

use crate::platform;

/// Version tag written into every encoded event.
pub const EVENT_VERSION: u8 = 1;

/// Maximum number of integer fields per event.
pub const MAX_FIELDS: usize = 4;

/// Maximum payload length in bytes; longer payloads are truncated.
pub const MAX_PAYLOAD: usize = 64;

/// Size of the fixed event header.
pub const EVENT_HEADER_SIZE: usize = 16;

/// Upper bound on the size of an encoded event.
pub const MAX_EVENT_SIZE: usize = EVENT_HEADER_SIZE + MAX_FIELDS * 8 + MAX_PAYLOAD;

/// Wire `cpu_id` of events from CPUs whose id does not fit in 8 bits.
pub const CPU_ID_SATURATED: u8 = u8::MAX;

/// Event kind used by the `trace_printk` helper.
pub const PRINTK_EVENT_KIND: u32 = 0xffff_0006;

/// Errors produced when decoding an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Record is shorter than its header claims.
    Truncated { len: usize },
    /// Unknown version tag.
    UnsupportedVersion(u8),
    /// `nr_fields` exceeds [`MAX_FIELDS`].
    TooManyFields(u8),
    /// `payload_len` exceeds [`MAX_PAYLOAD`].
    PayloadTooLong(u8),
    /// Bytes remain after the payload.
    TrailingBytes { expected: usize, actual: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "Event record truncated ({} bytes)", len),
            Self::UnsupportedVersion(v) => write!(f, "Unsupported event version {}", v),
            Self::TooManyFields(n) => write!(f, "Too many event fields: {}", n),
            Self::PayloadTooLong(n) => write!(f, "Event payload too long: {}", n),
            Self::TrailingBytes { expected, actual } => write!(
                f,
                "Event record has trailing bytes (expected {}, got {})",
                expected, actual
            ),
        }
    }
}

impl core::error::Error for DecodeError {}

/// A decoded trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    /// Probe-defined event kind.
    pub kind: u32,
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// CPU that emitted the event; ids that do not fit read as
    /// [`CPU_ID_SATURATED`].
    pub cpu_id: u8,
    fields: [u64; MAX_FIELDS],
    nr_fields: u8,
    payload: [u8; MAX_PAYLOAD],
    payload_len: u8,
}

impl TraceEvent {
    /// Build an event stamped with the current time and CPU.
    ///
    /// Extra fields and payload bytes beyond the fixed limits are dropped.
    pub fn new(kind: u32, fields: &[u64], payload: &[u8]) -> Self {
        let nr_fields = fields.len().min(MAX_FIELDS);
        let payload_len = payload.len().min(MAX_PAYLOAD);

        let stamp = platform::stamp();
        let mut event = Self {
            kind,
            timestamp_ns: stamp.timestamp_ns,
            cpu_id: u8::try_from(stamp.cpu_id).unwrap_or(CPU_ID_SATURATED),
            fields: [0; MAX_FIELDS],
            nr_fields: nr_fields as u8,
            payload: [0; MAX_PAYLOAD],
            payload_len: payload_len as u8,
        };
        event.fields[..nr_fields].copy_from_slice(&fields[..nr_fields]);
        event.payload[..payload_len].copy_from_slice(&payload[..payload_len]);
        event
    }

    /// Valid integer fields.
    pub fn fields(&self) -> &[u64] {
        &self.fields[..self.nr_fields as usize]
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(self.payload()).ok()
    }

    /// Size of this event once encoded.
    pub fn encoded_len(&self) -> usize {
        EVENT_HEADER_SIZE + self.fields().len() * 8 + self.payload().len()
    }

    /// Encode into a fresh bounded buffer.
    pub fn encode(&self) -> EncodedEvent {
        let mut out = EncodedEvent {
            buf: [0; MAX_EVENT_SIZE],
            len: self.encoded_len(),
        };
        let buf = &mut out.buf;

        buf[0] = EVENT_VERSION;
        buf[1] = self.nr_fields;
        buf[2] = self.payload_len;
        buf[3] = self.cpu_id;
        buf[4..8].copy_from_slice(&self.kind.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp_ns.to_le_bytes());

        let mut pos = EVENT_HEADER_SIZE;
        for field in self.fields() {
            buf[pos..pos + 8].copy_from_slice(&field.to_le_bytes());
            pos += 8;
        }
        buf[pos..pos + self.payload().len()].copy_from_slice(self.payload());
        out
    }

    /// Decode one record produced by [`TraceEvent::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(DecodeError::Truncated { len: data.len() });
        }
        if data[0] != EVENT_VERSION {
            return Err(DecodeError::UnsupportedVersion(data[0]));
        }

        let nr_fields = data[1];
        let payload_len = data[2];
        if nr_fields as usize > MAX_FIELDS {
            return Err(DecodeError::TooManyFields(nr_fields));
        }
        if payload_len as usize > MAX_PAYLOAD {
            return Err(DecodeError::PayloadTooLong(payload_len));
        }

        let expected = EVENT_HEADER_SIZE + nr_fields as usize * 8 + payload_len as usize;
        if data.len() < expected {
            return Err(DecodeError::Truncated { len: data.len() });
        }
        if data.len() > expected {
            return Err(DecodeError::TrailingBytes {
                expected,
                actual: data.len(),
            });
        }

        let mut event = Self {
            kind: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            timestamp_ns: read_u64(data, 8),
            cpu_id: data[3],
            fields: [0; MAX_FIELDS],
            nr_fields,
            payload: [0; MAX_PAYLOAD],
            payload_len,
        };

        let mut pos = EVENT_HEADER_SIZE;
        for field in event.fields.iter_mut().take(nr_fields as usize) {
            *field = read_u64(data, pos);
            pos += 8;
        }
        event.payload[..payload_len as usize].copy_from_slice(&data[pos..expected]);
        Ok(event)
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] cpu={} kind={} fields={:?}",
            self.timestamp_ns,
            self.cpu_id,
            self.kind,
            self.fields()
        )?;
        match self.payload_str() {
            Some(s) if !s.is_empty() => write!(f, " payload={:?}", s),
            Some(_) => Ok(()),
            None => write!(f, " payload={:x?}", self.payload()),
        }
    }
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(raw)
}

/// Stack-allocated encoded event.
#[derive(Clone)]
pub struct EncodedEvent {
    buf: [u8; MAX_EVENT_SIZE],
    len: usize,
}

impl EncodedEvent {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for EncodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedEvent")
            .field("len", &self.len)
            .field("bytes", &self.as_bytes())
            .finish()
    }
}

/// Encode an event stamped with the current time and CPU.
///
/// Never fails: `fields` beyond [`MAX_FIELDS`] and `payload` bytes beyond
/// [`MAX_PAYLOAD`] are truncated.
pub fn encode(kind: u32, fields: &[u64], payload: Option<&[u8]>) -> EncodedEvent {
    TraceEvent::new(kind, fields, payload.unwrap_or(&[])).encode()
}
