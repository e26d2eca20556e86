use axum::{
    Json,
    extract::{
        Path,
        Query,
        State,
    },
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    api::{
        Api,
        ApiError,
    },
    database::RecordRow,
    source::fm100,
};

const MAX_PER_PAGE: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_per_page() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub records: Vec<RecordRow>,
}

pub async fn get_records(
    State(api): State<Api>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse>, ApiError> {
    let per_page = query.per_page.clamp(1, MAX_PER_PAGE);
    let offset = i64::from(query.page) * i64::from(per_page);

    let total = api.database.count_records().await?;
    let records = api
        .database
        .list_records(i64::from(per_page), offset)
        .await?;

    Ok(Json(RecordsResponse {
        page: query.page,
        per_page,
        total,
        records,
    }))
}

pub async fn get_record(
    State(api): State<Api>,
    Path(id): Path<i64>,
) -> Result<Json<RecordRow>, ApiError> {
    let record = api
        .database
        .get_record(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub id: i64,
    pub subject: String,
}

/// Re-decodes the stored sensor payload and publishes the result, recording
/// the subject on the record.
pub async fn post_publish_record(
    State(api): State<Api>,
    Path(id): Path<i64>,
) -> Result<Json<PublishResponse>, ApiError> {
    let publisher = api
        .publisher
        .as_ref()
        .ok_or(ApiError::PublisherNotConfigured)?;

    let record = api
        .database
        .get_record(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let payload = record
        .sensor_payload
        .as_deref()
        .ok_or(ApiError::NotPublishable)?;
    let imei = record.imei.ok_or(ApiError::NotPublishable)?;

    let observation = fm100::decode(payload, record.session_time).map_err(|error| {
        tracing::debug!(id, %error, "stored payload did not decode");
        ApiError::NotPublishable
    })?;

    let subject = publisher.publish_observation(&imei, &observation).await?;
    api.database.set_publish_subject(id, &subject).await?;

    Ok(Json(PublishResponse { id, subject }))
}
