use serde::{Deserialize, Serialize};

use crate::error::StackError;

/// Retention periods CloudWatch Logs accepts, in days.
pub const LOG_RETENTION_DAYS: [u32; 22] = [
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

/// Log group the unit writes to. It has no owner; the unit only references it
/// by name, and it must exist before the unit does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSink {
    pub name: String,
    pub retention_days: u32,
}

impl LogSink {
    pub fn new(name: impl Into<String>, retention_days: u32) -> Result<Self, StackError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StackError::invalid("log_sink", "name must not be empty"));
        }
        if !LOG_RETENTION_DAYS.contains(&retention_days) {
            return Err(StackError::invalid(
                "log_retention_days",
                format!("{} is not a supported retention period", retention_days),
            ));
        }
        Ok(Self {
            name,
            retention_days,
        })
    }
}

/// Binds one policy document to one identity. The digest identifies the
/// exact document bytes that were attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAttachment {
    pub identity: String,
    pub policy_name: String,
    pub policy_digest: String,
}
