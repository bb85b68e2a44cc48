use actix_web::web;
use actix_web::HttpResponse;

use crate::deps::Deps;
use crate::domain::SubmissionId;
use crate::tracker;
use crate::utils::error_400;
use crate::utils::error_500;

/// `GET /status/{submissionId}` — the current tracker snapshot.
#[tracing::instrument(skip(deps))]
pub async fn status(
    path: web::Path<String>,
    deps: web::Data<Deps>,
) -> Result<HttpResponse, actix_web::Error> {
    let submission_id = SubmissionId::parse(&path).map_err(error_400)?;
    match tracker::get(&deps.pool, &submission_id)
        .await
        .map_err(error_500)?
    {
        Some(row) => Ok(HttpResponse::Ok().json(row)),
        None => Ok(HttpResponse::NotFound().finish()),
    }
}
