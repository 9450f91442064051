//! Progress policy: how an order's current stage translates into per-stage
//! status and which stage photos a customer gets to see.

use entity::stage_record::{self, Status};

use crate::stages::{FIRST_STAGE, STAGE_COUNT};

/// Stages below the current one are done, the current one is being worked on,
/// later ones have not started.
pub fn derive_stage_status(stage: i16, current_stage: i16) -> Status {
    match stage.cmp(&current_stage) {
        std::cmp::Ordering::Less => Status::Completed,
        std::cmp::Ordering::Equal => Status::InProgress,
        std::cmp::Ordering::Greater => Status::Pending,
    }
}

/// Visibility window for stage photos.
///
/// The current stage and anything after it are always shown. The stage right
/// before the current one stays visible until the current stage's record is
/// marked completed; a missing record counts as not completed. Older stages
/// are never shown.
pub fn should_show_photo(
    stage: i16,
    current_stage: i16,
    records: &[stage_record::Model],
) -> bool {
    if stage >= current_stage {
        return true;
    }
    if stage == current_stage - 1 {
        let current_done = records
            .iter()
            .find(|record| record.stage_number == current_stage)
            .map(|record| record.status == Status::Completed)
            .unwrap_or(false);
        return !current_done;
    }
    false
}

/// Share of the pipeline reached, rounded to a whole percent. Out-of-range
/// stages are clamped into the catalog first.
pub fn progress_percent(current_stage: i16) -> i32 {
    let clamped = current_stage.clamp(FIRST_STAGE, STAGE_COUNT) as f64;
    (clamped / STAGE_COUNT as f64 * 100.0).round() as i32
}
