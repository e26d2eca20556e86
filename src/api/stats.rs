use axum::{
    Json,
    extract::State,
};

use crate::{
    api::{
        Api,
        ApiError,
    },
    database::Stats,
};

pub async fn get_stats(State(api): State<Api>) -> Result<Json<Stats>, ApiError> {
    Ok(Json(api.database.stats().await?))
}
