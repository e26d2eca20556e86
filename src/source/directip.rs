//! Iridium SBD DirectIP mobile-originated messages.
//!
//! The Iridium gateway delivers each mobile-originated short-burst-data
//! message over its own TCP connection. A message starts with a three byte
//! preamble (protocol revision, 16 bit big-endian overall length), followed
//! by a sequence of information elements: one byte identifier, 16 bit
//! big-endian length, then that many bytes of body. Identifiers a receiver
//! doesn't recognize are skipped, so gateways can add elements without
//! breaking older receivers.
//!
//! Parsing is strictly best-effort. Truncated or garbled trailing data ends
//! the element scan but keeps everything read up to that point, and a parse
//! failure is reported in-band on the [`Envelope`] instead of as an error.
//! The gateway resends messages it considers unacknowledged, so a receiver
//! that drops a whole message over one bad element would re-ingest the rest
//! of it anyway.
//!
//! - [Iridium SBD DirectIP reference][1]
//!
//! [1]: https://docs.rockblock.rock7.com/docs/integration-with-application

use bytes::Buf;
use chrono::{
    DateTime,
    Utc,
};
use serde::Serialize;

/// MO header information element.
pub const IE_HEADER: u8 = 0x01;
/// MO payload information element.
pub const IE_PAYLOAD: u8 = 0x02;
/// MO location information element.
pub const IE_LOCATION: u8 = 0x03;
/// MO confirmation information element.
pub const IE_CONFIRMATION: u8 = 0x05;

const PREAMBLE_LENGTH: usize = 3;
const ELEMENT_HEADER_LENGTH: usize = 3;
const HEADER_ELEMENT_LENGTH: usize = 28;
const LOCATION_ELEMENT_LENGTH: usize = 11;

/// One unwrapped mobile-originated message.
///
/// Fields are only ever populated from bytes that were actually present in
/// their information element; an absent element leaves its fields `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Envelope {
    pub protocol_revision: Option<u8>,
    pub declared_length: Option<u16>,
    pub header: Option<SessionHeader>,
    pub payload: Option<Payload>,
    pub location: Option<GpsFix>,
    pub confirmation_status: Option<u8>,
    pub parsed: bool,
    pub parse_error: Option<String>,
}

/// MO header element: gateway session metadata.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionHeader {
    pub cdr_reference: u32,
    /// Station modem identifier, 15 ASCII digits as sent by the gateway.
    pub imei: String,
    pub session_status: u8,
    pub momsn: u16,
    pub mtmsn: u16,
    pub session_time: Option<DateTime<Utc>>,
}

/// MO payload element: the sensor payload carried by the message.
#[serde_with::serde_as]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Payload {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub bytes: Vec<u8>,
    /// Diagnostic rendering, only set when the whole payload is printable
    /// ASCII.
    pub text: Option<String>,
}

/// MO location element: the gateway's estimate of the station position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Circular error probable of the fix, meters.
    pub cep_radius: u16,
}

/// Parses one mobile-originated message.
///
/// Never fails: a message too short to carry the preamble, or any other
/// unparseable input, is reported through [`Envelope::parsed`] and
/// [`Envelope::parse_error`], keeping whatever fields were populated before
/// the problem.
pub fn parse(message: &[u8]) -> Envelope {
    let mut envelope = Envelope::default();

    if message.len() < PREAMBLE_LENGTH {
        envelope.parse_error = Some(format!("message too short: {} bytes", message.len()));
        return envelope;
    }

    let mut buf = message;
    envelope.protocol_revision = Some(buf.get_u8());
    envelope.declared_length = Some(buf.get_u16());

    while buf.len() >= ELEMENT_HEADER_LENGTH {
        let element_id = buf.get_u8();
        let element_length = usize::from(buf.get_u16());

        if element_length > buf.len() {
            // truncated element: stop the scan, keep what was read
            tracing::debug!(
                element_id,
                element_length,
                remaining = buf.len(),
                "truncated information element"
            );
            break;
        }

        let (body, rest) = buf.split_at(element_length);
        buf = rest;

        match element_id {
            IE_HEADER => envelope.header = parse_header(body),
            IE_PAYLOAD => envelope.payload = Some(parse_payload(body)),
            IE_LOCATION => envelope.location = parse_location(body),
            IE_CONFIRMATION => envelope.confirmation_status = body.first().copied(),
            _ => {
                tracing::debug!(element_id, element_length, "skipping information element");
            }
        }
    }

    envelope.parsed = true;
    envelope
}

fn parse_header(mut body: &[u8]) -> Option<SessionHeader> {
    if body.len() < HEADER_ELEMENT_LENGTH {
        return None;
    }

    let cdr_reference = body.get_u32();
    let (imei, rest) = body.split_at(15);
    body = rest;
    let session_status = body.get_u8();
    let momsn = body.get_u16();
    let mtmsn = body.get_u16();
    let session_time = DateTime::from_timestamp(i64::from(body.get_u32()), 0);

    Some(SessionHeader {
        cdr_reference,
        imei: trimmed_ascii(imei),
        session_status,
        momsn,
        mtmsn,
        session_time,
    })
}

fn parse_payload(body: &[u8]) -> Payload {
    Payload {
        text: printable_text(body),
        bytes: body.to_vec(),
    }
}

fn parse_location(mut body: &[u8]) -> Option<GpsFix> {
    if body.len() < LOCATION_ELEMENT_LENGTH {
        return None;
    }

    body.advance(1); // reserved
    let latitude = f64::from(body.get_i32()) * 1e-6;
    let longitude = f64::from(body.get_i32()) * 1e-6;
    let cep_radius = body.get_u16();

    Some(GpsFix {
        latitude,
        longitude,
        cep_radius,
    })
}

/// Non-ASCII bytes dropped, surrounding whitespace trimmed.
fn trimmed_ascii(bytes: &[u8]) -> String {
    let text: String = bytes
        .iter()
        .copied()
        .filter(|byte| byte.is_ascii())
        .map(char::from)
        .collect();
    text.trim().to_owned()
}

fn printable_text(bytes: &[u8]) -> Option<String> {
    bytes
        .iter()
        .all(|byte| byte.is_ascii_graphic() || *byte == b' ')
        .then(|| String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::{
        TimeZone,
        Utc,
    };

    use super::*;

    /// Header, location and payload elements around a 30 byte sensor
    /// payload.
    const REFERENCE_MESSAGE: &str = "01004e01001c1234567833303035333430363031323334353000039100006930183003000b00032d464dffa271de000302001e648003fb4ce06b01bfd21f5dd9beef9bffffffffffff97ed5fffc0f1fe00";

    /// A lone confirmation element.
    const CONFIRMATION_MESSAGE: &str = "01000405000101";

    /// An unrecognized element (id 0x42) before the header element.
    const UNKNOWN_ELEMENT_MESSAGE: &str =
        "010026420004deadbeef01001c12345678333030353334303630313233343530000391000069301830";

    /// A header element declaring only 24 bytes of body.
    const SHORT_HEADER_MESSAGE: &str =
        "01001b010018123456783330303533343036303132333435300003910000";

    /// A payload element carrying printable text.
    const TEXT_PAYLOAD_MESSAGE: &str = "01001002000d48454c4c4f2042554f59203432";

    fn message(hex: &str) -> Vec<u8> {
        hex::decode(hex).unwrap()
    }

    #[test]
    fn parses_a_full_mobile_originated_message() {
        let envelope = parse(&message(REFERENCE_MESSAGE));

        assert!(envelope.parsed);
        assert_eq!(envelope.parse_error, None);
        assert_eq!(envelope.protocol_revision, Some(1));
        assert_eq!(envelope.declared_length, Some(78));

        let header = envelope.header.unwrap();
        assert_eq!(header.cdr_reference, 0x12345678);
        assert_eq!(header.imei, "300534060123450");
        assert_eq!(header.session_status, 0);
        assert_eq!(header.momsn, 913);
        assert_eq!(header.mtmsn, 0);
        assert_eq!(
            header.session_time,
            Some(Utc.with_ymd_and_hms(2025, 12, 3, 11, 0, 0).unwrap())
        );

        let location = envelope.location.unwrap();
        assert_abs_diff_eq!(location.latitude, 53.298765, epsilon = 1e-9);
        assert_abs_diff_eq!(location.longitude, -6.131234, epsilon = 1e-9);
        assert_eq!(location.cep_radius, 3);

        let payload = envelope.payload.unwrap();
        assert_eq!(payload.bytes.len(), 30);
        assert_eq!(payload.bytes[0], 100);
        assert_eq!(payload.text, None);

        assert_eq!(envelope.confirmation_status, None);
    }

    #[test]
    fn parses_a_confirmation_message() {
        let envelope = parse(&message(CONFIRMATION_MESSAGE));

        assert!(envelope.parsed);
        assert_eq!(envelope.confirmation_status, Some(1));
        assert_eq!(envelope.header, None);
        assert_eq!(envelope.payload, None);
    }

    #[test]
    fn a_truncated_trailing_element_keeps_the_elements_before_it() {
        let full = message(REFERENCE_MESSAGE);
        // cut into the payload element's body
        let envelope = parse(&full[..full.len() - 10]);

        assert!(envelope.parsed);
        assert_eq!(envelope.parse_error, None);
        assert!(envelope.header.is_some());
        assert!(envelope.location.is_some());
        assert_eq!(envelope.payload, None);
    }

    #[test]
    fn skips_unrecognized_elements() {
        let envelope = parse(&message(UNKNOWN_ELEMENT_MESSAGE));

        assert!(envelope.parsed);
        let header = envelope.header.unwrap();
        assert_eq!(header.imei, "300534060123450");
        assert_eq!(header.momsn, 913);
    }

    #[test]
    fn skips_a_header_element_that_is_too_short() {
        let envelope = parse(&message(SHORT_HEADER_MESSAGE));

        assert!(envelope.parsed);
        assert_eq!(envelope.header, None);
    }

    #[test]
    fn keeps_printable_payload_text() {
        let envelope = parse(&message(TEXT_PAYLOAD_MESSAGE));

        let payload = envelope.payload.unwrap();
        assert_eq!(payload.text.as_deref(), Some("HELLO BUOY 42"));
        assert_eq!(payload.bytes, b"HELLO BUOY 42");
    }

    #[test]
    fn reports_messages_shorter_than_the_preamble() {
        let envelope = parse(&[0x01]);

        assert!(!envelope.parsed);
        assert_eq!(
            envelope.parse_error.as_deref(),
            Some("message too short: 1 bytes")
        );
        assert_eq!(envelope.protocol_revision, None);
        assert_eq!(envelope.declared_length, None);
    }

    #[test]
    fn parses_a_bare_preamble() {
        let envelope = parse(&message("010000"));

        assert!(envelope.parsed);
        assert_eq!(envelope.protocol_revision, Some(1));
        assert_eq!(envelope.declared_length, Some(0));
        assert_eq!(envelope.header, None);
        assert_eq!(envelope.payload, None);
        assert_eq!(envelope.location, None);
    }
}
