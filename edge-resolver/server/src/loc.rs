//! The location annotation carried on upstream hops.
//!
//! A forwarding node appends one LOC record (RFC 1876) to the end of the
//! Additional section, owned by the sentinel name `edge.site.`, encoding its
//! own coordinates. The receiving node consumes the annotation only when it
//! is the trailing Additional entry; anything else is left untouched and the
//! query is treated as client-originated.
//!
//! The wire library has no LOC rdata type, so the 16-octet RDATA is encoded
//! here over its unknown-record escape hatch.

use edge_resolver_core::Point;
use trust_dns_proto::{
    op::Message,
    rr::{rdata::NULL, DNSClass, Name, RData, Record, RecordType},
};

/// Owner name marking the annotation record.
pub const ANNOTATION_OWNER: &str = "edge.site.";

/// The LOC RR type code assigned by RFC 1876.
pub const LOC_TYPE: u16 = 29;

const LOC_VERSION: u8 = 0;
// Default precision octets per RFC 1876: 1 m size, 10 km horizontal and
// 10 m vertical precision, in the (base, exponent) nibble encoding.
const LOC_SIZE: u8 = 0x12;
const LOC_HORIZ_PRE: u8 = 0x16;
const LOC_VERT_PRE: u8 = 0x13;
// Thousandths of a second of arc per degree.
const DEGREES: f64 = 3_600_000.0;
// Lat/lon are biased by 2^31 (the equator / prime meridian).
const BIAS: i64 = 1 << 31;
// Altitude is centimeters above a base 100 000 m below sea level.
const ALTITUDE_SEA_LEVEL: u32 = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum InvalidLoc {
    #[error("not a loc record")]
    NotLoc,

    #[error("unexpected owner name")]
    WrongOwner,

    #[error("unsupported loc version")]
    BadVersion,

    #[error("loc rdata too short")]
    Malformed,

    #[error("coordinates out of range")]
    OutOfRange,
}

fn owner() -> Name {
    Name::from_ascii(ANNOTATION_OWNER).expect("the annotation owner is a valid name")
}

/// Builds the annotation record for `point` (class IN, TTL 0).
pub fn annotation_record(point: &Point) -> Result<Record, InvalidLoc> {
    if !(-90.0..=90.0).contains(&point.lat) || !(-180.0..=180.0).contains(&point.lon) {
        return Err(InvalidLoc::OutOfRange);
    }

    let mut rdata = Vec::with_capacity(16);
    rdata.extend_from_slice(&[LOC_VERSION, LOC_SIZE, LOC_HORIZ_PRE, LOC_VERT_PRE]);
    rdata.extend_from_slice(&encode_angle(point.lat));
    rdata.extend_from_slice(&encode_angle(point.lon));
    rdata.extend_from_slice(&ALTITUDE_SEA_LEVEL.to_be_bytes());

    let mut record = Record::from_rdata(
        owner(),
        0,
        RData::Unknown {
            code: LOC_TYPE,
            rdata: NULL::with(rdata),
        },
    );
    record.set_dns_class(DNSClass::IN);
    Ok(record)
}

/// Appends `record` (a prebuilt annotation) to the end of the Additional
/// section, where the receiving hop looks for it.
pub fn annotate(message: &mut Message, record: Record) {
    message.add_additional(record);
}

/// Removes and decodes the annotation iff it is the last Additional entry
/// and carries the sentinel owner; any other shape leaves the message
/// untouched.
pub fn extract_annotation(message: &mut Message) -> Option<Point> {
    let mut extras = message.take_additionals();
    let point = extras.last().and_then(|last| decode(last).ok());
    if point.is_some() {
        extras.pop();
    }
    message.insert_additionals(extras);
    point
}

/// Decodes a single LOC annotation record into a [`Point`].
pub fn decode(record: &Record) -> Result<Point, InvalidLoc> {
    if record.rr_type() != RecordType::Unknown(LOC_TYPE) {
        return Err(InvalidLoc::NotLoc);
    }
    if record.name().to_lowercase() != owner() {
        return Err(InvalidLoc::WrongOwner);
    }

    let rdata = match record.data() {
        Some(RData::Unknown { code, rdata }) if *code == LOC_TYPE => {
            rdata.anything()
        }
        _ => return Err(InvalidLoc::NotLoc),
    };
    if rdata.len() < 16 {
        return Err(InvalidLoc::Malformed);
    }
    if rdata[0] != LOC_VERSION {
        return Err(InvalidLoc::BadVersion);
    }

    let lat = decode_angle(&rdata[4..8]);
    let lon = decode_angle(&rdata[8..12]);
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(InvalidLoc::OutOfRange);
    }
    Ok(Point::new(lon, lat))
}

fn encode_angle(degrees: f64) -> [u8; 4] {
    let thousandths = (degrees * DEGREES).round() as i64;
    ((BIAS + thousandths) as u32).to_be_bytes()
}

fn decode_angle(bytes: &[u8]) -> f64 {
    let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (i64::from(raw) - BIAS) as f64 / DEGREES
}
