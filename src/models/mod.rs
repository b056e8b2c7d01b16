//! # Data Models
//!
//! SeaORM entities for the sync pipeline plus the small status vocabularies
//! stored in their text columns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod scheduled_job;
pub mod sync_batch;
pub mod sync_run;
pub mod sync_tracking;
pub mod synced_entity;

pub use scheduled_job::Entity as ScheduledJob;
pub use sync_batch::Entity as SyncBatch;
pub use sync_run::Entity as SyncRun;
pub use sync_tracking::Entity as SyncTracking;
pub use synced_entity::Entity as SyncedEntity;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "printsync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(
    /// Kind of vendor resource being synchronized
    EntityType, "entity type" {
        Product => "product",
        Order => "order",
    }
);

text_enum!(
    /// Lifecycle of a sync run. Moves forward only.
    RunStatus, "run status" {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Paused => "paused",
        Failed => "failed",
    }
);

text_enum!(
    /// Why a batch exists
    BatchKind, "batch kind" {
        Import => "import",
        Retry => "retry",
        Webhook => "webhook",
    }
);

text_enum!(
    BatchStatus, "batch status" {
        Scheduled => "scheduled",
        Processing => "processing",
        Deferred => "deferred",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

text_enum!(
    /// Per-entity sync state
    TrackingStatus, "tracking status" {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    JobStatus, "job status" {
        Queued => "queued",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

text_enum!(
    /// State of a mirrored vendor entity
    MirrorStatus, "mirror status" {
        Active => "active",
        Cancelled => "cancelled",
        Deleted => "deleted",
    }
);

impl RunStatus {
    /// Statuses a run may move to `self` from.
    pub fn allowed_predecessors(&self) -> &'static [RunStatus] {
        match self {
            RunStatus::Pending => &[],
            RunStatus::Running => &[RunStatus::Pending],
            RunStatus::Completed | RunStatus::Paused | RunStatus::Failed => {
                &[RunStatus::Pending, RunStatus::Running]
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Paused | RunStatus::Failed
        )
    }
}

impl BatchStatus {
    /// Batches that still have work ahead of them.
    pub const OPEN: [BatchStatus; 3] = [
        BatchStatus::Scheduled,
        BatchStatus::Deferred,
        BatchStatus::Processing,
    ];
}

impl JobStatus {
    pub const FINISHED: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];
}
