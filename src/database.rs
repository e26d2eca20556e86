use chrono::{
    DateTime,
    Utc,
};
use serde::Serialize;
use sqlx::PgPool;

use crate::{
    source::fm100::{
        Observation,
        PAYLOAD_SIZE,
    },
    types::{
        Imei,
        IngestionRecord,
    },
};

#[derive(Debug, thiserror::Error)]
#[error("database error")]
pub enum Error {
    Sqlx(#[from] sqlx::error::Error),
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = PgPool::connect(database_url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn insert_record(&self, record: &IngestionRecord) -> Result<i64, Error> {
        let envelope = &record.envelope;
        let header = envelope.header.as_ref();
        let location = envelope.location.as_ref();
        let obs = record.observation.as_ref();

        let (id,): (i64,) = sqlx::query_as(INSERT_RECORD)
            .bind(record.received_at)
            .bind(record.peer_address.ip().to_string())
            .bind(i32::from(record.peer_address.port()))
            .bind(&record.message)
            .bind(record.message_size as i32)
            .bind(record.imei)
            .bind(envelope.protocol_revision.map(i16::from))
            .bind(envelope.declared_length.map(i32::from))
            .bind(header.map(|header| i64::from(header.cdr_reference)))
            .bind(header.map(|header| header.imei.as_str()))
            .bind(header.map(|header| i16::from(header.session_status)))
            .bind(header.map(|header| i32::from(header.momsn)))
            .bind(header.map(|header| i32::from(header.mtmsn)))
            .bind(header.and_then(|header| header.session_time))
            .bind(location.map(|location| location.latitude))
            .bind(location.map(|location| location.longitude))
            .bind(location.map(|location| i32::from(location.cep_radius)))
            .bind(envelope.confirmation_status.map(i16::from))
            .bind(envelope.parsed)
            .bind(envelope.parse_error.as_deref())
            .bind(record.sensor_payload.as_deref())
            .bind(
                envelope
                    .payload
                    .as_ref()
                    .and_then(|payload| payload.text.as_deref()),
            )
            .bind(obs.map(|obs| obs.observation_time))
            .bind(obs.map(|obs| obs.callsign_encrypted))
            .bind(obs.and_then(|obs| obs.course_over_ground))
            .bind(obs.and_then(|obs| obs.speed_over_ground))
            .bind(obs.and_then(|obs| obs.heading))
            .bind(obs.and_then(|obs| obs.draft))
            .bind(obs.and_then(|obs| obs.latitude))
            .bind(obs.and_then(|obs| obs.longitude))
            .bind(obs.and_then(|obs| obs.pressure))
            .bind(obs.and_then(|obs| obs.pressure_msl))
            .bind(obs.and_then(|obs| obs.pressure_tendency))
            .bind(obs.and_then(|obs| obs.tendency_characteristic.map(i16::from)))
            .bind(obs.and_then(|obs| obs.wind_direction))
            .bind(obs.and_then(|obs| obs.wind_speed))
            .bind(obs.and_then(|obs| obs.wind_speed_knots))
            .bind(obs.and_then(|obs| obs.relative_wind_direction))
            .bind(obs.and_then(|obs| obs.relative_wind_speed))
            .bind(obs.and_then(|obs| obs.gust_speed))
            .bind(obs.and_then(|obs| obs.gust_direction))
            .bind(obs.and_then(|obs| obs.air_temperature))
            .bind(obs.and_then(|obs| obs.relative_humidity))
            .bind(obs.and_then(|obs| obs.sea_surface_temperature))
            .bind(obs.and_then(|obs| obs.battery_voltage))
            .bind(obs.and_then(|obs| obs.processor_temperature))
            .bind(obs.and_then(|obs| obs.gps_antenna_height))
            .bind(obs.map(|obs| obs.has_visual_block))
            .bind(obs.map(|obs| obs.has_wave_block))
            .bind(obs.map(|obs| obs.has_ice_block))
            .bind(obs.map(|obs| obs.has_other_block))
            .bind(obs.map(|obs| i16::from(obs.format_version)))
            .bind(obs.is_some())
            .bind(record.decode_error.as_deref())
            .bind(record.decoder_version)
            .fetch_one(&self.pool)
            .await?;

        Ok(id)
    }

    pub async fn get_record(&self, id: i64) -> Result<Option<RecordRow>, Error> {
        Ok(
            sqlx::query_as("select * from records where id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Newest records first.
    pub async fn list_records(&self, limit: i64, offset: i64) -> Result<Vec<RecordRow>, Error> {
        Ok(
            sqlx::query_as("select * from records order by id desc limit $1 offset $2")
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn count_records(&self) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("select count(*) from records")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn stats(&self) -> Result<Stats, Error> {
        Ok(sqlx::query_as(
            "select
                count(*) as total_records,
                count(*) filter (where parsed) as parsed_records,
                count(*) filter (where decoded) as decoded_records,
                count(distinct imei) as stations,
                max(received_at) as last_received_at
            from records",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Records whose stored sensor payload can be re-run through the codec.
    /// Already-decoded records are only returned with `include_decoded`.
    pub async fn reprocess_candidates(
        &self,
        limit: Option<i64>,
        include_decoded: bool,
    ) -> Result<Vec<ReprocessCandidate>, Error> {
        Ok(sqlx::query_as(
            "select id, sensor_payload, session_time, decoded
            from records
            where sensor_payload is not null
                and octet_length(sensor_payload) >= $1
                and (decoded = false or $2)
            order by id
            limit $3",
        )
        .bind(PAYLOAD_SIZE as i32)
        .bind(include_decoded)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn update_observation(
        &self,
        id: i64,
        observation: &Observation,
        decoder_version: &str,
    ) -> Result<(), Error> {
        sqlx::query(UPDATE_OBSERVATION)
            .bind(id)
            .bind(observation.observation_time)
            .bind(observation.callsign_encrypted)
            .bind(observation.course_over_ground)
            .bind(observation.speed_over_ground)
            .bind(observation.heading)
            .bind(observation.draft)
            .bind(observation.latitude)
            .bind(observation.longitude)
            .bind(observation.pressure)
            .bind(observation.pressure_msl)
            .bind(observation.pressure_tendency)
            .bind(observation.tendency_characteristic.map(i16::from))
            .bind(observation.wind_direction)
            .bind(observation.wind_speed)
            .bind(observation.wind_speed_knots)
            .bind(observation.relative_wind_direction)
            .bind(observation.relative_wind_speed)
            .bind(observation.gust_speed)
            .bind(observation.gust_direction)
            .bind(observation.air_temperature)
            .bind(observation.relative_humidity)
            .bind(observation.sea_surface_temperature)
            .bind(observation.battery_voltage)
            .bind(observation.processor_temperature)
            .bind(observation.gps_antenna_height)
            .bind(observation.has_visual_block)
            .bind(observation.has_wave_block)
            .bind(observation.has_ice_block)
            .bind(observation.has_other_block)
            .bind(i16::from(observation.format_version))
            .bind(decoder_version)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Clears the stored observation after a failed re-decode.
    pub async fn update_decode_failure(&self, id: i64, decode_error: &str) -> Result<(), Error> {
        sqlx::query(UPDATE_DECODE_FAILURE)
            .bind(id)
            .bind(decode_error)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_publish_subject(&self, id: i64, subject: &str) -> Result<(), Error> {
        sqlx::query("update records set publish_subject = $2 where id = $1")
            .bind(id)
            .bind(subject)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

const INSERT_RECORD: &str = "insert into records (
    received_at, peer_ip, peer_port, message, message_size, imei,
    protocol_revision, declared_length, cdr_reference, header_imei,
    session_status, momsn, mtmsn, session_time, envelope_latitude,
    envelope_longitude, cep_radius, confirmation_status, parsed, parse_error,
    sensor_payload, payload_text, observation_time, callsign_encrypted,
    course_over_ground, speed_over_ground, heading, draft, latitude,
    longitude, pressure, pressure_msl, pressure_tendency,
    tendency_characteristic, wind_direction, wind_speed, wind_speed_knots,
    relative_wind_direction, relative_wind_speed, gust_speed, gust_direction,
    air_temperature, relative_humidity, sea_surface_temperature,
    battery_voltage, processor_temperature, gps_antenna_height,
    has_visual_block, has_wave_block, has_ice_block, has_other_block,
    format_version, decoded, decode_error, decoder_version
) values (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
    $31, $32, $33, $34, $35, $36, $37, $38, $39, $40, $41, $42, $43, $44,
    $45, $46, $47, $48, $49, $50, $51, $52, $53, $54, $55
) returning id";

const UPDATE_OBSERVATION: &str = "update records set
    observation_time = $2,
    callsign_encrypted = $3,
    course_over_ground = $4,
    speed_over_ground = $5,
    heading = $6,
    draft = $7,
    latitude = $8,
    longitude = $9,
    pressure = $10,
    pressure_msl = $11,
    pressure_tendency = $12,
    tendency_characteristic = $13,
    wind_direction = $14,
    wind_speed = $15,
    wind_speed_knots = $16,
    relative_wind_direction = $17,
    relative_wind_speed = $18,
    gust_speed = $19,
    gust_direction = $20,
    air_temperature = $21,
    relative_humidity = $22,
    sea_surface_temperature = $23,
    battery_voltage = $24,
    processor_temperature = $25,
    gps_antenna_height = $26,
    has_visual_block = $27,
    has_wave_block = $28,
    has_ice_block = $29,
    has_other_block = $30,
    format_version = $31,
    decoded = true,
    decode_error = null,
    decoder_version = $32
where id = $1";

const UPDATE_DECODE_FAILURE: &str = "update records set
    observation_time = null,
    callsign_encrypted = null,
    course_over_ground = null,
    speed_over_ground = null,
    heading = null,
    draft = null,
    latitude = null,
    longitude = null,
    pressure = null,
    pressure_msl = null,
    pressure_tendency = null,
    tendency_characteristic = null,
    wind_direction = null,
    wind_speed = null,
    wind_speed_knots = null,
    relative_wind_direction = null,
    relative_wind_speed = null,
    gust_speed = null,
    gust_direction = null,
    air_temperature = null,
    relative_humidity = null,
    sea_surface_temperature = null,
    battery_voltage = null,
    processor_temperature = null,
    gps_antenna_height = null,
    has_visual_block = null,
    has_wave_block = null,
    has_ice_block = null,
    has_other_block = null,
    format_version = null,
    decoded = false,
    decode_error = $2,
    decoder_version = null
where id = $1";

/// One stored record, as returned by queries.
#[serde_with::serde_as]
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct RecordRow {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    pub peer_ip: String,
    pub peer_port: i32,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub message: Vec<u8>,
    pub message_size: i32,
    pub imei: Option<Imei>,
    pub protocol_revision: Option<i16>,
    pub declared_length: Option<i32>,
    pub cdr_reference: Option<i64>,
    pub header_imei: Option<String>,
    pub session_status: Option<i16>,
    pub momsn: Option<i32>,
    pub mtmsn: Option<i32>,
    pub session_time: Option<DateTime<Utc>>,
    pub envelope_latitude: Option<f64>,
    pub envelope_longitude: Option<f64>,
    pub cep_radius: Option<i32>,
    pub confirmation_status: Option<i16>,
    pub parsed: bool,
    pub parse_error: Option<String>,
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub sensor_payload: Option<Vec<u8>>,
    pub payload_text: Option<String>,
    pub observation_time: Option<DateTime<Utc>>,
    pub callsign_encrypted: Option<bool>,
    pub course_over_ground: Option<f64>,
    pub speed_over_ground: Option<f64>,
    pub heading: Option<f64>,
    pub draft: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub pressure: Option<f64>,
    pub pressure_msl: Option<f64>,
    pub pressure_tendency: Option<f64>,
    pub tendency_characteristic: Option<i16>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_speed_knots: Option<f64>,
    pub relative_wind_direction: Option<f64>,
    pub relative_wind_speed: Option<f64>,
    pub gust_speed: Option<f64>,
    pub gust_direction: Option<f64>,
    pub air_temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub sea_surface_temperature: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub processor_temperature: Option<f64>,
    pub gps_antenna_height: Option<f64>,
    pub has_visual_block: Option<bool>,
    pub has_wave_block: Option<bool>,
    pub has_ice_block: Option<bool>,
    pub has_other_block: Option<bool>,
    pub format_version: Option<i16>,
    pub decoded: bool,
    pub decode_error: Option<String>,
    pub decoder_version: Option<String>,
    pub publish_subject: Option<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct Stats {
    pub total_records: i64,
    pub parsed_records: i64,
    pub decoded_records: i64,
    pub stations: i64,
    pub last_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct ReprocessCandidate {
    pub id: i64,
    pub sensor_payload: Vec<u8>,
    pub session_time: Option<DateTime<Utc>>,
    pub decoded: bool,
}
