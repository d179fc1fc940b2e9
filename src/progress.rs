use std::sync::Arc;

use serde::Serialize;

use crate::database_ops::store::EntityKind;

/// Which part of a run a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "entity", rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Load(EntityKind),
}

/// Periodic progress event.
///
/// During fetch `done`/`total` count pages and `accumulated` counts records collected so far.
/// During load they count rows of the current entity kind and `accumulated` counts rows
/// written so far in that phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub done: usize,
    pub total: usize,
    pub accumulated: usize,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

pub(crate) fn emit(progress: Option<&ProgressFn>, event: Progress) {
    if let Some(cb) = progress {
        cb(event);
    }
}
