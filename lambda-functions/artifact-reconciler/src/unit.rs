use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::bundle::{ArtifactBundle, BundleDigest};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Default for Architecture {
    fn default() -> Self {
        Self::Arm64
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Self::X86_64),
            "arm64" => Ok(Self::Arm64),
            other => Err(ReconcileError::InvalidArchitecture(other.to_string())),
        }
    }
}

/// Fields that cannot change without replacing the deployed unit.
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[builder(on(String, into))]
pub struct RuntimeDescriptor {
    #[builder(default = "python3.12".to_string())]
    pub runtime: String,

    #[builder(default = "app.lambda_handler".to_string())]
    pub handler: String,

    #[builder(default)]
    pub architecture: Architecture,

    #[builder(default = 1024)]
    pub memory_mb: u32,

    #[builder(default = 300)]
    pub timeout_secs: u32,

    #[builder(default = 1024)]
    pub ephemeral_storage_mb: u32,
}

impl Default for RuntimeDescriptor {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RuntimeDescriptor {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let invalid = |field: &'static str, reason: String| {
            Err(ReconcileError::InvalidDescriptor { field, reason })
        };

        if self.runtime.trim().is_empty() {
            return invalid("runtime", "must not be empty".to_string());
        }
        if self.handler.trim().is_empty() {
            return invalid("handler", "must not be empty".to_string());
        }
        if !(128..=10_240).contains(&self.memory_mb) {
            return invalid("memory_mb", format!("{} is outside 128..=10240", self.memory_mb));
        }
        if !(1..=900).contains(&self.timeout_secs) {
            return invalid("timeout_secs", format!("{} is outside 1..=900", self.timeout_secs));
        }
        if !(512..=10_240).contains(&self.ephemeral_storage_mb) {
            return invalid(
                "ephemeral_storage_mb",
                format!("{} is outside 512..=10240", self.ephemeral_storage_mb),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLocation {
    pub bucket: String,
    pub key: String,
}

/// Desired state of a deployed unit for one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    pub role: String,
    pub log_sink: String,
    pub descriptor: RuntimeDescriptor,
    pub environment: BTreeMap<String, String>,
}

impl UnitSpec {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.name.trim().is_empty() {
            return Err(ReconcileError::InvalidDescriptor {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.role.trim().is_empty() {
            return Err(ReconcileError::InvalidDescriptor {
                field: "role",
                reason: "must not be empty".to_string(),
            });
        }
        self.descriptor.validate()
    }
}

/// Last state committed for a unit. Owned by the engine's state store and
/// handed back to the reconciler on the next pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub name: String,
    pub role: String,
    pub log_sink: String,
    pub descriptor: RuntimeDescriptor,
    pub environment: BTreeMap<String, String>,
    pub code: CodeLocation,
    pub digest: BundleDigest,
    pub revision: u64,
    pub deployed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum UnitChange {
    Code { from: BundleDigest, to: BundleDigest },
    Runtime { from: String, to: String },
    Handler { from: String, to: String },
    Architecture { from: Architecture, to: Architecture },
    Memory { from: u32, to: u32 },
    Timeout { from: u32, to: u32 },
    EphemeralStorage { from: u32, to: u32 },
    Role { from: String, to: String },
    LogSink { from: String, to: String },
    Environment,
}

impl fmt::Display for UnitChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code { from, to } => write!(f, "code {} -> {}", from, to),
            Self::Runtime { from, to } => write!(f, "runtime {} -> {}", from, to),
            Self::Handler { from, to } => write!(f, "handler {} -> {}", from, to),
            Self::Architecture { from, to } => write!(f, "architecture {} -> {}", from, to),
            Self::Memory { from, to } => write!(f, "memory {}MB -> {}MB", from, to),
            Self::Timeout { from, to } => write!(f, "timeout {}s -> {}s", from, to),
            Self::EphemeralStorage { from, to } => {
                write!(f, "ephemeral storage {}MB -> {}MB", from, to)
            }
            Self::Role { from, to } => write!(f, "role {} -> {}", from, to),
            Self::LogSink { from, to } => write!(f, "log sink {} -> {}", from, to),
            Self::Environment => write!(f, "environment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum UnitPlan {
    Create,
    Unchanged,
    Replace { changes: Vec<UnitChange> },
}

impl UnitPlan {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    pub fn code_changed(&self) -> bool {
        match self {
            Self::Create => true,
            Self::Unchanged => false,
            Self::Replace { changes } => changes.iter().any(|c| matches!(c, UnitChange::Code { .. })),
        }
    }
}

/// Compares the desired unit and freshly computed bundle against the last
/// committed record. A record kept under another unit name says nothing about
/// this unit, which is then created.
pub fn plan_unit(spec: &UnitSpec, bundle: &ArtifactBundle, last: Option<&UnitRecord>) -> UnitPlan {
    let Some(last) = last.filter(|r| r.name == spec.name) else {
        return UnitPlan::Create;
    };

    let mut changes = Vec::new();
    if last.digest != *bundle.digest() {
        changes.push(UnitChange::Code {
            from: last.digest.clone(),
            to: bundle.digest().clone(),
        });
    }

    let (old, new) = (&last.descriptor, &spec.descriptor);
    if old.runtime != new.runtime {
        changes.push(UnitChange::Runtime {
            from: old.runtime.clone(),
            to: new.runtime.clone(),
        });
    }
    if old.handler != new.handler {
        changes.push(UnitChange::Handler {
            from: old.handler.clone(),
            to: new.handler.clone(),
        });
    }
    if old.architecture != new.architecture {
        changes.push(UnitChange::Architecture {
            from: old.architecture,
            to: new.architecture,
        });
    }
    if old.memory_mb != new.memory_mb {
        changes.push(UnitChange::Memory {
            from: old.memory_mb,
            to: new.memory_mb,
        });
    }
    if old.timeout_secs != new.timeout_secs {
        changes.push(UnitChange::Timeout {
            from: old.timeout_secs,
            to: new.timeout_secs,
        });
    }
    if old.ephemeral_storage_mb != new.ephemeral_storage_mb {
        changes.push(UnitChange::EphemeralStorage {
            from: old.ephemeral_storage_mb,
            to: new.ephemeral_storage_mb,
        });
    }
    if last.role != spec.role {
        changes.push(UnitChange::Role {
            from: last.role.clone(),
            to: spec.role.clone(),
        });
    }
    if last.log_sink != spec.log_sink {
        changes.push(UnitChange::LogSink {
            from: last.log_sink.clone(),
            to: spec.log_sink.clone(),
        });
    }
    if last.environment != spec.environment {
        changes.push(UnitChange::Environment);
    }

    if changes.is_empty() {
        UnitPlan::Unchanged
    } else {
        UnitPlan::Replace { changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> UnitSpec {
        UnitSpec {
            name: "uptime-uptime-lambda".to_string(),
            role: "uptime-uptime-lambda-role".to_string(),
            log_sink: "/aws/lambda/uptime-uptime-lambda".to_string(),
            descriptor: RuntimeDescriptor::default(),
            environment: BTreeMap::from([("SLO_TARGET".to_string(), "99.9".to_string())]),
        }
    }

    fn record_for(spec: &UnitSpec, bundle: &ArtifactBundle) -> UnitRecord {
        UnitRecord {
            name: spec.name.clone(),
            role: spec.role.clone(),
            log_sink: spec.log_sink.clone(),
            descriptor: spec.descriptor.clone(),
            environment: spec.environment.clone(),
            code: CodeLocation {
                bucket: "deploy".to_string(),
                key: format!("bundles/{}/{}.bundle", spec.name, bundle.digest().hex()),
            },
            digest: bundle.digest().clone(),
            revision: 1,
            deployed_at: "2025-01-06T12:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_architecture_parsing() {
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert_eq!("x86_64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert!("aarch64".parse::<Architecture>().is_err());
        assert!("ARM64".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = RuntimeDescriptor::default();
        assert_eq!(descriptor.runtime, "python3.12");
        assert_eq!(descriptor.handler, "app.lambda_handler");
        assert_eq!(descriptor.architecture, Architecture::Arm64);
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_descriptor_limits() {
        let too_small = RuntimeDescriptor::builder().memory_mb(64).build();
        assert!(matches!(
            too_small.validate(),
            Err(ReconcileError::InvalidDescriptor { field: "memory_mb", .. })
        ));

        let too_long = RuntimeDescriptor::builder().timeout_secs(901).build();
        assert!(too_long.validate().is_err());

        let no_handler = RuntimeDescriptor::builder().handler("").build();
        assert!(no_handler.validate().is_err());
    }

    #[test]
    fn test_plan_without_record_creates() {
        let bundle = ArtifactBundle::single("app.py", b"v1".to_vec()).unwrap();
        assert_eq!(plan_unit(&spec(), &bundle, None), UnitPlan::Create);
    }

    #[test]
    fn test_plan_unchanged() {
        let spec = spec();
        let bundle = ArtifactBundle::single("app.py", b"v1".to_vec()).unwrap();
        let record = record_for(&spec, &bundle);
        assert!(plan_unit(&spec, &bundle, Some(&record)).is_noop());
    }

    #[test]
    fn test_plan_lists_every_change() {
        let mut spec = spec();
        let old_bundle = ArtifactBundle::single("app.py", b"v1".to_vec()).unwrap();
        let record = record_for(&spec, &old_bundle);

        spec.descriptor.architecture = Architecture::X86_64;
        spec.descriptor.timeout_secs = 60;
        spec.environment.insert("FAIL_STREAK".to_string(), "5".to_string());
        let new_bundle = ArtifactBundle::single("app.py", b"v2".to_vec()).unwrap();

        let plan = plan_unit(&spec, &new_bundle, Some(&record));
        let UnitPlan::Replace { changes } = &plan else {
            panic!("expected replace, got {:?}", plan);
        };
        assert_eq!(changes.len(), 4);
        assert!(plan.code_changed());
        assert!(changes.contains(&UnitChange::Environment));
        assert!(changes.contains(&UnitChange::Timeout { from: 300, to: 60 }));
    }

    #[test]
    fn test_descriptor_only_change_keeps_code() {
        let mut spec = spec();
        let bundle = ArtifactBundle::single("app.py", b"v1".to_vec()).unwrap();
        let record = record_for(&spec, &bundle);
        spec.descriptor.memory_mb = 2048;

        let plan = plan_unit(&spec, &bundle, Some(&record));
        assert!(!plan.code_changed());
        assert_eq!(
            plan,
            UnitPlan::Replace {
                changes: vec![UnitChange::Memory { from: 1024, to: 2048 }]
            }
        );
    }

    #[test]
    fn test_renamed_unit_is_created() {
        let old = spec();
        let bundle = ArtifactBundle::single("app.py", b"v1".to_vec()).unwrap();
        let record = record_for(&old, &bundle);

        let renamed = UnitSpec {
            name: "new-uptime-lambda".to_string(),
            ..old
        };
        assert_eq!(plan_unit(&renamed, &bundle, Some(&record)), UnitPlan::Create);
    }

    #[test]
    fn test_change_display() {
        let change = UnitChange::Memory { from: 1024, to: 2048 };
        assert_eq!(change.to_string(), "memory 1024MB -> 2048MB");
    }
}
