pub mod bundle;
pub mod unit;

use chrono::Utc;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use bundle::{ArtifactBundle, BundleDigest, BUNDLE_MAGIC};
pub use unit::{
    plan_unit, Architecture, CodeLocation, RuntimeDescriptor, UnitChange, UnitPlan, UnitRecord,
    UnitSpec,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("concurrent update: {0}")]
    Conflict(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("bundle has no entries")]
    EmptyBundle,
    #[error("bundle entry has an empty path")]
    EmptyPath,
    #[error("bundle entry '{path}' appears more than once")]
    DuplicatePath { path: String },
    #[error("architecture '{0}' is not one of x86_64, arm64")]
    InvalidArchitecture(String),
    #[error("invalid {field}: {reason}")]
    InvalidDescriptor { field: &'static str, reason: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Engine(EngineError::Conflict(_)))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Engine(EngineError::Transient(_)))
    }
}

/// Mutations the reconciler needs from the provisioning engine.
pub trait UnitEngine {
    /// Stores the packaged bundle. Keyed by digest, so storing the same
    /// bundle twice is harmless.
    fn upload_bundle(
        &self,
        unit: &str,
        bundle: &ArtifactBundle,
    ) -> impl Future<Output = Result<CodeLocation, EngineError>> + Send;

    /// Commits code pointer, digest and descriptor as one record. Must fail
    /// with [`EngineError::Conflict`] unless the stored revision equals
    /// `expected_revision` (`None`: no record exists yet).
    fn swap_unit(
        &self,
        expected_revision: Option<u64>,
        record: &UnitRecord,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub plan: UnitPlan,
    pub record: UnitRecord,
    pub uploaded: bool,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        !self.plan.is_noop()
    }
}

/// Runs one reconciliation step for a unit.
///
/// `last` is the record from the previous successful pass. The returned
/// record replaces it only when this function returns `Ok`; on any error the
/// caller keeps `last`, and running again with the same content converges.
pub async fn reconcile<E: UnitEngine>(
    engine: &E,
    spec: &UnitSpec,
    bundle: &ArtifactBundle,
    last: Option<&UnitRecord>,
) -> Result<ReconcileOutcome, ReconcileError> {
    spec.validate()?;

    let last = match last {
        Some(record) if record.name != spec.name => {
            debug!("Record for {} does not describe {}, creating", record.name, spec.name);
            None
        }
        other => other,
    };

    let plan = plan_unit(spec, bundle, last);
    if plan.is_noop() {
        if let Some(record) = last {
            info!("Unit {} is up to date at {}", spec.name, record.digest);
            return Ok(ReconcileOutcome {
                plan,
                record: record.clone(),
                uploaded: false,
            });
        }
    }

    let (code, uploaded) = match last {
        Some(record) if !plan.code_changed() => (record.code.clone(), false),
        _ => {
            let code = engine.upload_bundle(&spec.name, bundle).await?;
            info!(
                "Uploaded bundle {} for {} to s3://{}/{}",
                bundle.digest(),
                spec.name,
                code.bucket,
                code.key
            );
            (code, true)
        }
    };

    let expected_revision = last.map(|r| r.revision);
    let record = UnitRecord {
        name: spec.name.clone(),
        role: spec.role.clone(),
        log_sink: spec.log_sink.clone(),
        descriptor: spec.descriptor.clone(),
        environment: spec.environment.clone(),
        code,
        digest: bundle.digest().clone(),
        revision: expected_revision.map_or(1, |r| r + 1),
        deployed_at: Utc::now().to_rfc3339(),
    };

    if let Err(e) = engine.swap_unit(expected_revision, &record).await {
        warn!("Swap of {} to {} failed: {}", spec.name, record.digest, e);
        return Err(e.into());
    }

    info!(
        "Unit {} now at {} (revision {})",
        record.name, record.digest, record.revision
    );

    Ok(ReconcileOutcome {
        plan,
        record,
        uploaded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = ReconcileError::from(EngineError::Conflict("revision 3".to_string()));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_transient());

        let transient = ReconcileError::from(EngineError::Transient("timeout".to_string()));
        assert!(transient.is_transient());
        assert_eq!(transient.to_string(), "transient provider failure: timeout");

        assert!(!ReconcileError::EmptyBundle.is_conflict());
    }

    #[test]
    fn test_outcome_changed() {
        let bundle = ArtifactBundle::single("app.py", b"x".to_vec()).unwrap();
        let outcome = ReconcileOutcome {
            plan: UnitPlan::Unchanged,
            record: UnitRecord {
                name: "unit".to_string(),
                role: "role".to_string(),
                log_sink: "/aws/lambda/unit".to_string(),
                descriptor: RuntimeDescriptor::default(),
                environment: Default::default(),
                code: CodeLocation {
                    bucket: "b".to_string(),
                    key: "k".to_string(),
                },
                digest: bundle.digest().clone(),
                revision: 1,
                deployed_at: String::new(),
            },
            uploaded: false,
        };
        assert!(!outcome.changed());
    }
}
