//! Publishes decoded observations to NATS for downstream consumers.

use serde::Serialize;

use crate::{
    source::fm100::Observation,
    types::Imei,
};

/// Current subject version prefix.
const VERSION: &str = "v1";

#[derive(Debug, thiserror::Error)]
#[error("publisher error")]
pub enum Error {
    Connect(#[from] async_nats::ConnectError),
    Publish(#[from] async_nats::PublishError),
    Flush(#[from] async_nats::client::FlushError),
    Json(#[from] serde_json::Error),
}

/// Subject names used on the wire.
///
/// Every subject flows through this struct so the naming convention is
/// defined in exactly one place.
pub struct Subjects;

impl Subjects {
    /// Subject observations from a single station are published on.
    pub fn observations(imei: &Imei) -> String {
        format!("saws.{VERSION}.observations.{imei}")
    }

    /// Wildcard subject matching observations from every station.
    pub fn observations_wildcard() -> String {
        format!("saws.{VERSION}.observations.>")
    }
}

#[derive(Clone, Debug)]
pub struct Publisher {
    client: async_nats::Client,
}

impl Publisher {
    pub async fn connect(nats_url: &str) -> Result<Self, Error> {
        let client = async_nats::connect(nats_url).await?;

        Ok(Self { client })
    }

    /// Publishes one observation as JSON, returning the subject used.
    pub async fn publish_observation(
        &self,
        imei: &Imei,
        observation: &Observation,
    ) -> Result<String, Error> {
        let subject = Subjects::observations(imei);
        let body = serde_json::to_vec(&ObservationMessage { imei, observation })?;

        self.client.publish(subject.clone(), body.into()).await?;
        self.client.flush().await?;

        tracing::debug!(%imei, subject, "published observation");

        Ok(subject)
    }
}

/// JSON body published for each observation.
#[derive(Debug, Serialize)]
struct ObservationMessage<'a> {
    imei: &'a Imei,
    #[serde(flatten)]
    observation: &'a Observation,
}
