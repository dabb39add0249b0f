use super::errors::SpawnError;

pub type SpawnResult<T> = Result<T, SpawnError>;

/// Error type accepted from user work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Maps an error returned by work onto the pool's taxonomy.
///
/// Work that propagates a [`SpawnError`] (for instance through
/// `TaskContext::check()?`) keeps its kind; anything else is an execution failure.
pub(crate) fn from_work_error(err: BoxError) -> SpawnError {
    match err.downcast::<SpawnError>() {
        Ok(spawn_err) => *spawn_err,
        Err(other) => SpawnError::Execution(other.to_string()),
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{:?}", payload)
    }
}
