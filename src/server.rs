//! DirectIP receiving server.

use std::net::SocketAddr;

use tokio::{
    io::AsyncReadExt,
    net::{
        TcpListener,
        TcpStream,
    },
};
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::Instrument;

use crate::{
    sink::RecordSink,
    source::{
        directip,
        fm100,
    },
    types::{
        Imei,
        IngestionRecord,
        RawMessage,
    },
};

/// Upper bound on a single message read from a connection.
///
/// Mobile-originated payloads top out under 2 KiB, plus a few dozen bytes of
/// envelope. A connection is read up to this limit and whatever arrived is
/// ingested as-is.
pub const MAX_MESSAGE_SIZE: u64 = 4096;

/// Server errors
#[derive(Debug, thiserror::Error)]
#[error("ingest server error")]
pub enum Error {
    Io(#[from] std::io::Error),

    /// Error from the sink a finished record was handed to.
    Sink(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A DirectIP receiver.
///
/// Accepts any number of concurrent connections. The gateway opens one
/// connection per mobile-originated message, transmits it and closes; each
/// connection handler reads to end-of-stream, parses what arrived and hands
/// the result to the sink.
#[derive(Debug)]
pub struct IngestServer<S> {
    tcp_listener: TcpListener,
    sink: S,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl<S> IngestServer<S> {
    pub fn new(tcp_listener: TcpListener, sink: S) -> Self {
        Self {
            tcp_listener,
            sink,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Provide a [`CancellationToken`] with which the server (and all open
    /// connections) can be shut down.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.tcp_listener.local_addr()?)
    }
}

impl<S> IngestServer<S>
where
    S: RecordSink,
{
    /// Serve incoming connections until shut down.
    ///
    /// On shutdown the accept loop stops first, then every connection
    /// handler still running is waited on, so an accepted message is never
    /// dropped mid-ingest.
    pub async fn serve(self) -> Result<(), Error> {
        tracing::debug!("waiting for connections");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.tcp_listener.accept() => {
                    let (connection, address) = result?;
                    let shutdown = self.shutdown.clone();
                    let sink = self.sink.clone();
                    let span = tracing::info_span!("connection", %address);
                    self.connections.spawn(
                        async move {
                            tracing::debug!(%address, "new connection");
                            if let Err(error) = handle_connection(connection, address, shutdown, sink).await {
                                tracing::error!(?error);
                            }
                            tracing::debug!(%address, "closing connection");
                        }
                        .instrument(span),
                    );
                }
            }
        }

        self.connections.close();
        self.connections.wait().await;

        Ok(())
    }
}

async fn handle_connection<S>(
    connection: TcpStream,
    address: SocketAddr,
    shutdown: CancellationToken,
    sink: S,
) -> Result<(), Error>
where
    S: RecordSink,
{
    let mut connection = connection.take(MAX_MESSAGE_SIZE);
    let mut bytes = Vec::new();

    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        result = connection.read_to_end(&mut bytes) => {
            result?;
        }
    }

    if bytes.is_empty() {
        tracing::debug!("connection closed without data");
        return Ok(());
    }

    let record = ingest(RawMessage::new(bytes, address));

    tracing::debug!(
        size = record.message_size,
        imei = ?record.imei,
        parsed = record.envelope.parsed,
        decoded = record.observation.is_some(),
        "received message"
    );

    let publishable = record.imei.zip(record.observation.clone());

    let id = sink
        .store(record)
        .await
        .map_err(|error| Error::Sink(Box::new(error)))?;

    tracing::debug!(id, "record stored");

    if let Some((imei, observation)) = publishable {
        // best effort: the record is already stored, a failed publish only
        // loses the live notification
        match sink.publish(&imei, &observation).await {
            Ok(subject) => {
                tracing::debug!(%imei, subject, "observation published");
            }
            Err(error) => {
                tracing::warn!(%imei, %error, "publishing observation failed");
            }
        }
    }

    Ok(())
}

/// Turns one received message into a storable record.
///
/// Never fails: parse and decode problems are recorded in-band on the
/// returned record.
fn ingest(message: RawMessage) -> IngestionRecord {
    let envelope = directip::parse(&message.bytes);

    // A message without an envelope that is exactly one payload long is
    // taken to be a bare sensor payload.
    let sensor_payload = envelope
        .payload
        .as_ref()
        .map(|payload| payload.bytes.clone())
        .or_else(|| (message.bytes.len() == fm100::PAYLOAD_SIZE).then(|| message.bytes.clone()));

    let fallback_time = envelope
        .header
        .as_ref()
        .and_then(|header| header.session_time);

    let (observation, decode_error) = match &sensor_payload {
        Some(payload) => {
            match fm100::decode(payload, fallback_time) {
                Ok(observation) => (Some(observation), None),
                Err(error) => {
                    tracing::debug!(%error, "payload did not decode");
                    (None, Some(error.to_string()))
                }
            }
        }
        None => (None, None),
    };

    let imei = envelope
        .header
        .as_ref()
        .and_then(|header| header.imei.parse().ok())
        .or_else(|| Imei::scan(&message.bytes));

    let decoder_version = observation.is_some().then_some(fm100::DECODER_VERSION);

    IngestionRecord {
        received_at: message.received_at,
        peer_address: message.peer_address,
        message_size: message.bytes.len(),
        message: message.bytes,
        imei,
        envelope,
        sensor_payload,
        observation,
        decode_error,
        decoder_version,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{
            Arc,
            Mutex,
        },
        time::Duration,
    };

    use chrono::{
        TimeZone,
        Utc,
    };
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::source::fm100::Observation;

    /// Header, location and payload elements around a 30 byte sensor
    /// payload.
    const REFERENCE_MESSAGE: &str = "01004e01001c1234567833303035333430363031323334353000039100006930183003000b00032d464dffa271de000302001e648003fb4ce06b01bfd21f5dd9beef9bffffffffffff97ed5fffc0f1fe00";

    /// The sensor payload from [`REFERENCE_MESSAGE`] on its own.
    const BARE_PAYLOAD: &str =
        "648003fb4ce06b01bfd21f5dd9beef9bffffffffffff97ed5fffc0f1fe00";

    fn peer() -> SocketAddr {
        "10.20.30.40:52010".parse().unwrap()
    }

    fn raw(hex: &str) -> RawMessage {
        RawMessage::new(hex::decode(hex).unwrap(), peer())
    }

    #[derive(Clone, Debug, Default)]
    struct MemorySink {
        records: Arc<Mutex<Vec<IngestionRecord>>>,
    }

    impl RecordSink for MemorySink {
        type Error = Infallible;

        async fn store(&self, record: IngestionRecord) -> Result<i64, Infallible> {
            let mut records = self.records.lock().unwrap();
            records.push(record);
            Ok(records.len() as i64)
        }

        async fn publish(
            &self,
            _imei: &Imei,
            _observation: &Observation,
        ) -> Result<String, Infallible> {
            Ok("memory".to_owned())
        }
    }

    #[test]
    fn ingests_an_enveloped_message() {
        let record = ingest(raw(REFERENCE_MESSAGE));

        assert!(record.envelope.parsed);
        assert_eq!(record.imei, Some("300534060123450".parse().unwrap()));
        assert_eq!(record.message_size, 81);
        assert_eq!(
            record.sensor_payload.as_ref().map(|payload| payload.len()),
            Some(30),
        );
        assert_eq!(record.decode_error, None);
        assert_eq!(record.decoder_version, Some(fm100::DECODER_VERSION));

        let observation = record.observation.unwrap();
        assert_eq!(
            observation.observation_time,
            Utc.with_ymd_and_hms(2025, 12, 3, 11, 0, 0).unwrap(),
        );
    }

    #[test]
    fn ingests_a_bare_sensor_payload() {
        let record = ingest(raw(BARE_PAYLOAD));

        // no envelope means no station identity, so nothing to publish
        assert_eq!(record.imei, None);
        assert_eq!(record.envelope.payload, None);
        assert_eq!(
            record.sensor_payload.as_ref().map(|payload| payload.len()),
            Some(30),
        );

        let observation = record.observation.unwrap();
        assert_eq!(
            observation.observation_time,
            Utc.with_ymd_and_hms(2025, 12, 3, 11, 0, 0).unwrap(),
        );
        assert_eq!(observation.air_temperature, Some(10.75));
    }

    #[test]
    fn recovers_station_identity_from_unparseable_bytes() {
        let record = ingest(RawMessage::new(
            b"ID=300534060123450;OK".to_vec(),
            peer(),
        ));

        assert_eq!(record.imei, Some("300534060123450".parse().unwrap()));
        assert_eq!(record.sensor_payload, None);
        assert_eq!(record.observation, None);
        assert_eq!(record.decode_error, None);
    }

    #[test]
    fn ingests_garbage_without_failing() {
        let record = ingest(RawMessage::new(vec![0xff], peer()));

        assert!(!record.envelope.parsed);
        assert_eq!(
            record.envelope.parse_error.as_deref(),
            Some("message too short: 1 bytes"),
        );
        assert_eq!(record.imei, None);
        assert_eq!(record.observation, None);
        assert_eq!(record.message, vec![0xff]);
    }

    #[test]
    fn undecodable_payload_is_recorded_in_band() {
        // a payload element of 4 bytes, too short for the sensor format
        let record = ingest(raw("0100070200040a0b0c0d"));

        assert!(record.envelope.parsed);
        assert_eq!(record.sensor_payload, Some(vec![0x0a, 0x0b, 0x0c, 0x0d]));
        assert_eq!(record.observation, None);
        assert_eq!(
            record.decode_error.as_deref(),
            Some("payload too short: 4 bytes, expected at least 30"),
        );
        assert_eq!(record.decoder_version, None);
    }

    #[tokio::test]
    async fn serves_a_connection_end_to_end() {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = tcp_listener.local_addr().unwrap();
        let sink = MemorySink::default();
        let shutdown = CancellationToken::new();
        let server =
            IngestServer::new(tcp_listener, sink.clone()).with_shutdown(shutdown.clone());
        let server_task = tokio::spawn(server.serve());

        let mut connection = TcpStream::connect(address).await.unwrap();
        connection
            .write_all(&hex::decode(REFERENCE_MESSAGE).unwrap())
            .await
            .unwrap();
        connection.shutdown().await.unwrap();
        drop(connection);

        for _ in 0..100 {
            if !sink.records.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        server_task.await.unwrap().unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].peer_address.ip(), address.ip());
        assert_eq!(records[0].imei, Some("300534060123450".parse().unwrap()));
        assert!(records[0].observation.is_some());
    }

    #[tokio::test]
    async fn ignores_connections_that_send_nothing() {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = tcp_listener.local_addr().unwrap();
        let sink = MemorySink::default();
        let shutdown = CancellationToken::new();
        let server =
            IngestServer::new(tcp_listener, sink.clone()).with_shutdown(shutdown.clone());
        let server_task = tokio::spawn(server.serve());

        let connection = TcpStream::connect(address).await.unwrap();
        drop(connection);

        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        server_task.await.unwrap().unwrap();

        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shuts_down_without_connections() {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let server =
            IngestServer::new(tcp_listener, MemorySink::default()).with_shutdown(shutdown.clone());

        shutdown.cancel();
        server.serve().await.unwrap();
    }
}
