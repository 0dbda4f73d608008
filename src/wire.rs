//! Hop-Stamped Wire Protocol
//!
//! `;`-delimited text frames shared by every chain participant.
//! A frame starts as `cycle_id;message_id;origin_ts` and grows by one
//! `received_ts;delay_ms;sent_ts` triplet per hop traversed.
//!
//! Every participant (balancer, service, forward service) goes through the
//! same decode/stamp/encode path, so framing stays byte-identical no matter
//! where a hop sits in the chain.

use chrono::{Local, NaiveDateTime};

/// Field separator on the wire.
pub const FIELD_DELIMITER: char = ';';

/// Minimum fields for a processable frame (cycle_id, message_id, origin_ts).
pub const MIN_FIELDS: usize = 3;

/// Fields appended by a single hop.
pub const TRIPLET_FIELDS: usize = 3;

/// ISO-8601 local date-time, fixed 6-digit sub-second precision, no offset.
const TS_ENCODE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Decoding accepts any sub-second precision (including none).
const TS_DECODE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Wall-clock timestamp as written into frames.
#[inline]
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Format a timestamp the way frames carry it.
pub fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_ENCODE_FORMAT).to_string()
}

/// Parse a frame timestamp field.
pub fn parse_ts(field: &str) -> Result<NaiveDateTime, WireError> {
    NaiveDateTime::parse_from_str(field, TS_DECODE_FORMAT)
        .map_err(|_| WireError::BadTimestamp(field.to_string()))
}

/// Milliseconds between two timestamps, signed (clock skew passes through).
fn millis_between(earlier: NaiveDateTime, later: NaiveDateTime) -> f64 {
    let delta = later.signed_duration_since(earlier);
    delta
        .num_microseconds()
        .map(|us| us as f64 / 1_000.0)
        .unwrap_or_else(|| delta.num_milliseconds() as f64)
}

/// Timing triplet appended by one hop.
#[derive(Debug, Clone, PartialEq)]
pub struct HopStamp {
    /// Wall-clock time the hop read the frame.
    pub received_ts: NaiveDateTime,
    /// Elapsed ms between the previous timestamp in the frame and `received_ts`.
    pub delay_ms: f64,
    /// Wall-clock time the hop was about to transmit the extended frame.
    pub sent_ts: NaiveDateTime,
}

/// Typed probe frame.
///
/// Append-only: hops only ever push one [`HopStamp`]; prior fields are never
/// removed, reordered, or rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub cycle_id: u64,
    pub message_id: u64,
    /// Set once by the source, never modified downstream.
    pub origin_ts: NaiveDateTime,
    pub hops: Vec<HopStamp>,
}

impl Frame {
    pub fn new(cycle_id: u64, message_id: u64, origin_ts: NaiveDateTime) -> Self {
        Self {
            cycle_id,
            message_id,
            origin_ts,
            hops: Vec::new(),
        }
    }

    /// Decode a raw wire frame.
    ///
    /// Splits on the delimiter, tolerates a single trailing delimiter, trims
    /// whitespace per field, and rejects anything shorter than [`MIN_FIELDS`]
    /// before parsing individual fields.
    pub fn decode(raw: &str) -> Result<Self, WireError> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_suffix(FIELD_DELIMITER).unwrap_or(trimmed);
        let fields: Vec<&str> = trimmed.split(FIELD_DELIMITER).map(str::trim).collect();

        if fields.len() < MIN_FIELDS {
            return Err(WireError::TooFewFields(fields.len()));
        }

        let cycle_id = parse_id("cycle_id", fields[0])?;
        let message_id = parse_id("message_id", fields[1])?;
        let origin_ts = parse_ts(fields[2])?;

        let tail = &fields[MIN_FIELDS..];
        if tail.len() % TRIPLET_FIELDS != 0 {
            return Err(WireError::RaggedTriplets(fields.len()));
        }

        let mut hops = Vec::with_capacity(tail.len() / TRIPLET_FIELDS);
        for triplet in tail.chunks_exact(TRIPLET_FIELDS) {
            hops.push(HopStamp {
                received_ts: parse_ts(triplet[0])?,
                delay_ms: triplet[1]
                    .parse::<f64>()
                    .map_err(|_| WireError::BadDelay(triplet[1].to_string()))?,
                sent_ts: parse_ts(triplet[2])?,
            });
        }

        Ok(Self {
            cycle_id,
            message_id,
            origin_ts,
            hops,
        })
    }

    /// Encode to the wire form, no trailing delimiter.
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{};{};{}",
            self.cycle_id,
            self.message_id,
            format_ts(self.origin_ts)
        );
        for hop in &self.hops {
            out.push(FIELD_DELIMITER);
            out.push_str(&format_ts(hop.received_ts));
            out.push(FIELD_DELIMITER);
            out.push_str(&format!("{:.6}", hop.delay_ms));
            out.push(FIELD_DELIMITER);
            out.push_str(&format_ts(hop.sent_ts));
        }
        out
    }

    /// The most recent timestamp in the frame: the prior hop's `sent_ts`,
    /// or `origin_ts` when no hop has stamped yet.
    pub fn last_timestamp(&self) -> NaiveDateTime {
        self.hops.last().map(|h| h.sent_ts).unwrap_or(self.origin_ts)
    }

    /// Append this hop's timing triplet.
    ///
    /// `delay_ms` is computed against [`Frame::last_timestamp`]; it is never
    /// taken from the wire. Negative values under clock skew are kept as-is.
    pub fn stamp(&mut self, received_ts: NaiveDateTime, sent_ts: NaiveDateTime) {
        let delay_ms = millis_between(self.last_timestamp(), received_ts);
        self.hops.push(HopStamp {
            received_ts,
            delay_ms,
            sent_ts,
        });
    }

    /// Total field count in the encoded form.
    pub fn field_count(&self) -> usize {
        MIN_FIELDS + self.hops.len() * TRIPLET_FIELDS
    }
}

fn parse_id(field: &'static str, value: &str) -> Result<u64, WireError> {
    match value.parse::<u64>() {
        Ok(id) if id >= 1 => Ok(id),
        _ => Err(WireError::BadId {
            field,
            value: value.to_string(),
        }),
    }
}

/// Errors while decoding a wire frame.
///
/// All variants are locally recoverable: callers log and skip the offending
/// message rather than tearing anything down.
#[derive(Debug, Clone)]
pub enum WireError {
    TooFewFields(usize),
    RaggedTriplets(usize),
    BadId { field: &'static str, value: String },
    BadTimestamp(String),
    BadDelay(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewFields(n) => {
                write!(f, "too few fields: {} (minimum {})", n, MIN_FIELDS)
            }
            Self::RaggedTriplets(n) => {
                write!(f, "hop fields not a whole number of triplets ({} fields total)", n)
            }
            Self::BadId { field, value } => write!(f, "invalid {}: {:?}", field, value),
            Self::BadTimestamp(v) => write!(f, "invalid timestamp: {:?}", v),
            Self::BadDelay(v) => write!(f, "invalid delay: {:?}", v),
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        parse_ts(s).unwrap()
    }

    #[test]
    fn test_decode_minimum_frame() {
        let frame = Frame::decode("1;1;2024-01-01T00:00:00.000000").unwrap();
        assert_eq!(frame.cycle_id, 1);
        assert_eq!(frame.message_id, 1);
        assert!(frame.hops.is_empty());
        assert_eq!(frame.field_count(), 3);
    }

    #[test]
    fn test_decode_tolerates_trailing_delimiter_and_whitespace() {
        let frame = Frame::decode(" 7;3;2024-01-01T00:00:00.000000; \n").unwrap();
        assert_eq!(frame.cycle_id, 7);
        assert_eq!(frame.message_id, 3);
    }

    #[test]
    fn test_decode_rejects_zero_one_two_fields() {
        for raw in ["", "1", "1;2", "1;2;"] {
            let err = Frame::decode(raw).unwrap_err();
            assert!(matches!(err, WireError::TooFewFields(_)), "raw={:?}", raw);
        }
        // Exactly three fields is accepted.
        assert!(Frame::decode("1;2;2024-01-01T00:00:00.000000").is_ok());
    }

    #[test]
    fn test_decode_rejects_ragged_hop_tail() {
        let raw = "1;1;2024-01-01T00:00:00.000000;2024-01-01T00:00:00.100000;100.000000";
        assert!(matches!(
            Frame::decode(raw),
            Err(WireError::RaggedTriplets(5))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_ids() {
        assert!(matches!(
            Frame::decode("0;1;2024-01-01T00:00:00.000000"),
            Err(WireError::BadId { field: "cycle_id", .. })
        ));
        assert!(matches!(
            Frame::decode("1;x;2024-01-01T00:00:00.000000"),
            Err(WireError::BadId { field: "message_id", .. })
        ));
    }

    #[test]
    fn test_stamp_appends_exactly_one_triplet() {
        let mut frame = Frame::decode("1;1;2024-01-01T00:00:00.000000;").unwrap();
        let before = frame.encode();

        frame.stamp(
            ts("2024-01-01T00:00:00.250000"),
            ts("2024-01-01T00:00:00.260000"),
        );

        assert_eq!(frame.hops.len(), 1);
        assert_eq!(frame.field_count(), 6);
        // Prior fields are byte-identical the whole way through.
        assert!(frame.encode().starts_with(&before));
        assert_eq!(
            frame.encode(),
            "1;1;2024-01-01T00:00:00.000000;\
             2024-01-01T00:00:00.250000;250.000000;2024-01-01T00:00:00.260000"
        );
    }

    #[test]
    fn test_stamp_delay_uses_previous_hop_sent_ts() {
        let mut frame = Frame::new(1, 1, ts("2024-01-01T00:00:00.000000"));
        frame.stamp(
            ts("2024-01-01T00:00:00.100000"),
            ts("2024-01-01T00:00:00.150000"),
        );
        // Second hop measures against the first hop's sent_ts, not the origin.
        frame.stamp(
            ts("2024-01-01T00:00:00.400000"),
            ts("2024-01-01T00:00:00.410000"),
        );
        assert_eq!(frame.hops[0].delay_ms, 100.0);
        assert_eq!(frame.hops[1].delay_ms, 250.0);
    }

    #[test]
    fn test_stamp_negative_delay_passes_through() {
        let mut frame = Frame::new(1, 1, ts("2024-01-01T00:00:01.000000"));
        frame.stamp(
            ts("2024-01-01T00:00:00.500000"),
            ts("2024-01-01T00:00:00.600000"),
        );
        assert_eq!(frame.hops[0].delay_ms, -500.0);
        assert!(frame.encode().contains(";-500.000000;"));
    }

    #[test]
    fn test_delay_encodes_six_decimals() {
        let mut frame = Frame::new(1, 1, ts("2024-01-01T00:00:00.000000"));
        frame.stamp(
            ts("2024-01-01T00:00:00.000123"),
            ts("2024-01-01T00:00:00.000200"),
        );
        assert!(frame.encode().contains(";0.123000;"));
    }

    #[test]
    fn test_decode_encode_roundtrip_with_hops() {
        let raw = "2;5;2024-01-01T10:00:00.000000;\
                   2024-01-01T10:00:00.010000;10.000000;2024-01-01T10:00:00.020000;\
                   2024-01-01T10:00:00.050000;30.000000;2024-01-01T10:00:00.060000";
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.hops.len(), 2);
        assert_eq!(frame.encode(), raw);
    }

    #[test]
    fn test_decode_rejects_garbage_timestamp() {
        assert!(matches!(
            Frame::decode("1;1;not-a-timestamp"),
            Err(WireError::BadTimestamp(_))
        ));
    }
}
