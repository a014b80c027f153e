use thiserror::Error;

/// A schedule that cannot take part in liveness checking.
///
/// Jobs carrying one are marked misconfigured and skipped until the
/// schedule is fixed; nothing else about them stops working.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron spec: {0}")]
    Parse(String),

    #[error("unknown timezone: {0}")]
    Timezone(String),
}

impl From<ScheduleError> for crab_core::CrabError {
    fn from(err: ScheduleError) -> Self {
        crab_core::CrabError::Schedule(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
