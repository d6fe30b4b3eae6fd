//! Job health.

use axum::{extract::State, Json};
use common::{api::models::JobHealthReport, time::TimestampMs};
use patron_core::scheduler;

use super::{ApiError, AppState};

pub async fn jobs(
    State(state): State<AppState>,
) -> Result<Json<JobHealthReport>, ApiError> {
    let jobs =
        scheduler::read_health(&state.ctx.cache, TimestampMs::now()).await;
    Ok(Json(JobHealthReport { jobs }))
}
