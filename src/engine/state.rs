use std::fmt;

use crate::engine::models::CycleReport;

/// Steps of one feed cycle, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStage {
    Fetch,
    Diff,
    Download,
    Publish,
    Prune,
    Persist,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fetch => "fetch",
            Self::Diff => "diff",
            Self::Download => "download",
            Self::Publish => "publish",
            Self::Prune => "prune",
            Self::Persist => "persist",
        };
        f.write_str(label)
    }
}

// Progress pushed to whoever watches a cycle (the provisioning bar).
#[derive(Clone, Debug)]
pub enum SyncEvent {
    Stage { feed: String, stage: CycleStage },
    Planned { feed: String, missing: usize },
    Synced { feed: String, path: String },
    Finished(CycleReport),
    Failed { feed: String, error: String },
}
