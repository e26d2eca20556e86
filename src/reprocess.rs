//! Batch re-decode of stored sensor payloads.

use crate::{
    database::Database,
    source::fm100,
};

#[derive(Clone, Debug, clap::Args)]
pub struct ReprocessOptions {
    /// Reprocess at most this many records.
    #[clap(long)]
    pub limit: Option<i64>,

    /// Also reprocess records that already decoded successfully.
    #[clap(long)]
    pub force: bool,

    /// Decode without writing anything back.
    #[clap(long)]
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReprocessSummary {
    pub processed: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Runs every candidate record through the decoder again and stores the
/// outcome.
///
/// Live ingest and reprocessing share one decoder, so a rerun after a
/// decoder fix brings historical records in line with current behavior. A
/// record that no longer decodes has its observation cleared and the error
/// stored in its place.
pub async fn reprocess(
    database: &Database,
    options: &ReprocessOptions,
) -> Result<ReprocessSummary, crate::Error> {
    let candidates = database
        .reprocess_candidates(options.limit, options.force)
        .await?;

    tracing::info!(
        candidates = candidates.len(),
        dry_run = options.dry_run,
        "reprocessing records"
    );

    let mut summary = ReprocessSummary::default();

    for candidate in candidates {
        summary.processed += 1;

        match fm100::decode(&candidate.sensor_payload, candidate.session_time) {
            Ok(observation) => {
                if !options.dry_run {
                    database
                        .update_observation(candidate.id, &observation, fm100::DECODER_VERSION)
                        .await?;
                }
                summary.updated += 1;
                tracing::debug!(id = candidate.id, "record re-decoded");
            }
            Err(error) => {
                if !options.dry_run {
                    database
                        .update_decode_failure(candidate.id, &error.to_string())
                        .await?;
                }
                summary.failed += 1;
                tracing::debug!(id = candidate.id, %error, "record no longer decodes");
            }
        }
    }

    tracing::info!(
        processed = summary.processed,
        updated = summary.updated,
        failed = summary.failed,
        "reprocessing finished"
    );

    Ok(summary)
}
