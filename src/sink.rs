//! Downstream handoff for ingested records.

use crate::{
    database::Database,
    publisher::Publisher,
    source::fm100::Observation,
    types::{
        Imei,
        IngestionRecord,
    },
};

/// Where finished records go.
///
/// The server hands every record to [`store`][RecordSink::store] and, when
/// an observation was decoded for a known station, offers it to
/// [`publish`][RecordSink::publish]. One sink is shared by all connection
/// handlers, so implementations must be safe for concurrent use.
pub trait RecordSink: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persists a record, returning its storage id.
    fn store(
        &self,
        record: IngestionRecord,
    ) -> impl Future<Output = Result<i64, Self::Error>> + Send;

    /// Publishes a decoded observation keyed by station, returning the
    /// subject it went out on.
    fn publish(
        &self,
        imei: &Imei,
        observation: &Observation,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send;
}

/// Sink errors
#[derive(Debug, thiserror::Error)]
#[error("sink error")]
pub enum Error {
    Database(#[from] crate::database::Error),
    Publisher(#[from] crate::publisher::Error),
    #[error("no publisher configured")]
    PublisherNotConfigured,
}

/// Production sink: records go to Postgres, observations go out on the
/// message bus.
#[derive(Clone, Debug)]
pub struct ObservationSink {
    database: Database,
    publisher: Option<Publisher>,
}

impl ObservationSink {
    pub fn new(database: Database, publisher: Option<Publisher>) -> Self {
        Self {
            database,
            publisher,
        }
    }
}

impl RecordSink for ObservationSink {
    type Error = Error;

    async fn store(&self, record: IngestionRecord) -> Result<i64, Error> {
        Ok(self.database.insert_record(&record).await?)
    }

    async fn publish(&self, imei: &Imei, observation: &Observation) -> Result<String, Error> {
        let publisher = self
            .publisher
            .as_ref()
            .ok_or(Error::PublisherNotConfigured)?;
        Ok(publisher.publish_observation(imei, observation).await?)
    }
}
