use std::{
    fmt::{
        Debug,
        Display,
    },
    net::SocketAddr,
    str::FromStr,
};

use chrono::{
    DateTime,
    Utc,
};
use serde::Serialize;
use serde_with::{
    DeserializeFromStr,
    SerializeDisplay,
};

use crate::source::{
    directip::Envelope,
    fm100::Observation,
};

/// Station modem identifier: the 15 digit IMEI of the Iridium transceiver.
///
/// This is the key everything downstream routes by, so it is validated once
/// at the ingest boundary and carried as a type from there on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Imei {
    number: u64,
}

impl Imei {
    /// Finds the first run of 15 ASCII digits in `data`.
    ///
    /// Fallback identification for messages whose header element is missing
    /// or garbled: the gateway puts the IMEI at a fixed place in the header
    /// bytes, so a raw scan still recovers it.
    pub fn scan(data: &[u8]) -> Option<Self> {
        data.windows(15).find_map(|window| {
            window.iter().all(|byte| byte.is_ascii_digit()).then(|| {
                let number = window
                    .iter()
                    .fold(0, |number, byte| number * 10 + u64::from(byte - b'0'));
                Self { number }
            })
        })
    }
}

impl Display for Imei {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:015}", self.number)
    }
}

impl Debug for Imei {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Imei({self})")
    }
}

impl FromStr for Imei {
    type Err = ImeiFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || {
            ImeiFromStrError {
                input: s.to_owned(),
            }
        };

        if s.len() != 15 || !s.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(err());
        }
        let number = s.parse().map_err(|_| err())?;

        Ok(Self { number })
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("Invalid IMEI: {input}")]
pub struct ImeiFromStrError {
    pub input: String,
}

impl<DB: sqlx::Database> sqlx::Type<DB> for Imei
where
    i64: sqlx::Type<DB>,
{
    fn type_info() -> DB::TypeInfo {
        <i64 as sqlx::Type<DB>>::type_info()
    }
}

impl<'q, DB: sqlx::Database> sqlx::Encode<'q, DB> for Imei
where
    i64: sqlx::Encode<'q, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <i64 as sqlx::Encode<DB>>::encode_by_ref(&(self.number as i64), buf)
    }
}

impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for Imei
where
    i64: sqlx::Decode<'r, DB>,
{
    fn decode(
        value: <DB as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let number = <i64 as sqlx::Decode<DB>>::decode(value)?;
        Ok(Self {
            number: number as u64,
        })
    }
}

/// One message as it came off the socket.
///
/// Owned by a single connection handler and dropped once its
/// [`IngestionRecord`] has been handed off.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub peer_address: SocketAddr,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(bytes: Vec<u8>, peer_address: SocketAddr) -> Self {
        Self {
            bytes,
            peer_address,
            received_at: Utc::now(),
        }
    }
}

/// Everything known about one received message: reception metadata, the
/// unwrapped envelope and the decoded observation, merged for handoff to
/// the sink. Built once per connection and not mutated afterwards.
#[serde_with::serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct IngestionRecord {
    pub received_at: DateTime<Utc>,
    pub peer_address: SocketAddr,
    pub message_size: usize,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub message: Vec<u8>,
    /// Validated station identifier from the envelope header, or recovered
    /// by [`Imei::scan`] when the header was unusable.
    pub imei: Option<Imei>,
    pub envelope: Envelope,
    /// The bytes that were handed to the payload codec, if any.
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub sensor_payload: Option<Vec<u8>>,
    pub observation: Option<Observation>,
    pub decode_error: Option<String>,
    pub decoder_version: Option<&'static str>,
}
