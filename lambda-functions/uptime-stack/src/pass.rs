use artifact_reconciler::{
    plan_unit, reconcile, ArtifactBundle, BundleDigest, EngineError, UnitEngine, UnitPlan,
    UnitRecord, UnitSpec,
};
use permission_boundary::{
    build_policy, Identity, PolicyDocument, TrustPolicy, LAMBDA_SERVICE_PRINCIPAL,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tracing::{debug, info};

use crate::error::StackError;
use crate::graph::{ResourceGraph, ResourceNode};
use crate::inputs::{StackInputs, StackOutputs};
use crate::resources::{LogSink, PolicyAttachment};

/// Engine operations beyond the unit itself. Every call is an idempotent
/// "make it so"; the engine owns retries.
pub trait ProvisioningEngine: UnitEngine {
    /// Creates the identity, or destroys and recreates it when `replace` is
    /// set because its trust policy changed.
    fn ensure_identity(
        &self,
        identity: &Identity,
        replace: bool,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn put_role_policy(
        &self,
        attachment: &PolicyAttachment,
        policy: &PolicyDocument,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn ensure_log_sink(&self, sink: &LogSink)
        -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Last-known state of every resource, as recorded by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackState {
    pub identity: Option<Identity>,
    pub attachment: Option<PolicyAttachment>,
    pub log_sink: Option<LogSink>,
    pub unit: Option<UnitRecord>,
}

/// Everything a pass needs, validated and built before any engine call.
#[derive(Debug, Clone)]
pub struct DesiredStack {
    pub identity: Identity,
    pub policy: PolicyDocument,
    pub attachment: PolicyAttachment,
    pub log_sink: LogSink,
    pub unit: UnitSpec,
    pub bundle: ArtifactBundle,
    pub outputs: StackOutputs,
    pub order: Vec<ResourceNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Replace,
    Update,
    Unchanged,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Replace => write!(f, "replace"),
            Self::Update => write!(f, "update"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAction {
    pub node: ResourceNode,
    pub kind: ActionKind,
    pub detail: String,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.node, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub state: StackState,
    pub actions: Vec<ResourceAction>,
    pub outputs: StackOutputs,
    pub digest: BundleDigest,
}

impl PassReport {
    pub fn changed(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.kind != ActionKind::Unchanged)
            .count()
    }

    pub fn unit_replaced(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.node == ResourceNode::DeployedUnit && a.kind != ActionKind::Unchanged)
    }
}

/// Every document of the stack built from the inputs alone, before the code
/// bundle is read.
#[derive(Debug, Clone)]
pub struct PreparedStack {
    pub identity: Identity,
    pub policy: PolicyDocument,
    pub attachment: PolicyAttachment,
    pub log_sink: LogSink,
    pub unit: UnitSpec,
    pub outputs: StackOutputs,
    pub order: Vec<ResourceNode>,
}

impl PreparedStack {
    pub fn with_bundle(self, bundle: ArtifactBundle) -> DesiredStack {
        DesiredStack {
            identity: self.identity,
            policy: self.policy,
            attachment: self.attachment,
            log_sink: self.log_sink,
            unit: self.unit,
            bundle,
            outputs: self.outputs,
            order: self.order,
        }
    }
}

/// Validates the inputs and builds every document of the stack. Nothing here
/// talks to the engine or the bundle source, so a rejected input leaves all
/// resources untouched.
pub fn prepare_inputs(inputs: &StackInputs) -> Result<PreparedStack, StackError> {
    let architecture = inputs.validate()?;

    let identity = Identity::new(
        inputs.role_name(),
        TrustPolicy::for_service(LAMBDA_SERVICE_PRINCIPAL)?,
    );
    let policy = build_policy(&inputs.grants())?;
    let attachment = PolicyAttachment {
        identity: identity.name.clone(),
        policy_name: inputs.policy_name(),
        policy_digest: policy.digest(),
    };
    let log_sink = LogSink::new(inputs.log_group_name(), inputs.log_retention_days)?;

    let unit = UnitSpec {
        name: inputs.function_name(),
        role: identity.name.clone(),
        log_sink: log_sink.name.clone(),
        descriptor: inputs.descriptor(architecture),
        environment: inputs.environment(),
    };
    unit.validate()?;

    let order = ResourceGraph::stack().topological_order()?;
    debug!("Evaluation order: {:?}", order);

    Ok(PreparedStack {
        identity,
        policy,
        attachment,
        log_sink,
        unit,
        outputs: inputs.outputs(),
        order,
    })
}

pub fn prepare(inputs: &StackInputs, bundle: ArtifactBundle) -> Result<DesiredStack, StackError> {
    Ok(prepare_inputs(inputs)?.with_bundle(bundle))
}

fn identity_action(desired: &DesiredStack, state: &StackState) -> ResourceAction {
    let (kind, detail) = match &state.identity {
        None => (ActionKind::Create, desired.identity.name.clone()),
        Some(recorded) if desired.identity.requires_replacement(recorded) => (
            ActionKind::Replace,
            format!("{} (trust policy changed)", desired.identity.name),
        ),
        Some(_) => (ActionKind::Unchanged, desired.identity.name.clone()),
    };
    ResourceAction {
        node: ResourceNode::Identity,
        kind,
        detail,
    }
}

fn policy_document_action(desired: &DesiredStack, state: &StackState) -> ResourceAction {
    let kind = match &state.attachment {
        Some(a) if a.policy_digest == desired.attachment.policy_digest => ActionKind::Unchanged,
        Some(_) => ActionKind::Update,
        None => ActionKind::Create,
    };
    ResourceAction {
        node: ResourceNode::PolicyDocument,
        kind,
        detail: desired.attachment.policy_digest.clone(),
    }
}

fn attachment_action(
    desired: &DesiredStack,
    state: &StackState,
    identity_replaced: bool,
) -> ResourceAction {
    let kind = match &state.attachment {
        None => ActionKind::Create,
        Some(_) if identity_replaced => ActionKind::Replace,
        Some(recorded) if *recorded != desired.attachment => ActionKind::Update,
        Some(_) => ActionKind::Unchanged,
    };
    ResourceAction {
        node: ResourceNode::PolicyAttachment,
        kind,
        detail: format!(
            "{} -> {}",
            desired.attachment.policy_name, desired.attachment.identity
        ),
    }
}

fn log_sink_action(desired: &DesiredStack, state: &StackState) -> ResourceAction {
    let kind = match &state.log_sink {
        None => ActionKind::Create,
        Some(recorded) if *recorded != desired.log_sink => ActionKind::Update,
        Some(_) => ActionKind::Unchanged,
    };
    ResourceAction {
        node: ResourceNode::LogSink,
        kind,
        detail: format!(
            "{} ({} days)",
            desired.log_sink.name, desired.log_sink.retention_days
        ),
    }
}

fn unit_action(desired: &DesiredStack, plan: &UnitPlan) -> ResourceAction {
    let (kind, detail) = match plan {
        UnitPlan::Create => (
            ActionKind::Create,
            format!("{} at {}", desired.unit.name, desired.bundle.digest()),
        ),
        UnitPlan::Unchanged => (
            ActionKind::Unchanged,
            format!("{} at {}", desired.unit.name, desired.bundle.digest()),
        ),
        UnitPlan::Replace { changes } => (
            ActionKind::Replace,
            format!(
                "{}: {}",
                desired.unit.name,
                changes
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ),
    };
    ResourceAction {
        node: ResourceNode::DeployedUnit,
        kind,
        detail,
    }
}

/// Reports what [`run_pass`] would do, in evaluation order, without calling
/// the engine.
pub fn plan_pass(desired: &DesiredStack, state: &StackState) -> Vec<ResourceAction> {
    let identity_replaced = identity_action(desired, state).kind == ActionKind::Replace;
    desired
        .order
        .iter()
        .map(|node| match node {
            ResourceNode::Identity => identity_action(desired, state),
            ResourceNode::PolicyDocument => policy_document_action(desired, state),
            ResourceNode::PolicyAttachment => attachment_action(desired, state, identity_replaced),
            ResourceNode::LogSink => log_sink_action(desired, state),
            ResourceNode::DeployedUnit => unit_action(
                desired,
                &plan_unit(&desired.unit, &desired.bundle, state.unit.as_ref()),
            ),
        })
        .collect()
}

/// Converges the recorded state towards `desired`, one resource at a time in
/// dependency order.
///
/// The returned state reflects every committed step. On error the caller
/// should keep the state it passed in; steps the engine already committed
/// are idempotent and the next pass re-applies them harmlessly.
pub async fn run_pass<E: ProvisioningEngine>(
    engine: &E,
    desired: &DesiredStack,
    state: StackState,
) -> Result<PassReport, StackError> {
    let mut next = state.clone();
    let mut actions = Vec::with_capacity(desired.order.len());
    let mut identity_replaced = false;

    for node in &desired.order {
        let action = match node {
            ResourceNode::Identity => {
                let action = identity_action(desired, &state);
                match action.kind {
                    ActionKind::Create => engine.ensure_identity(&desired.identity, false).await?,
                    ActionKind::Replace => {
                        engine.ensure_identity(&desired.identity, true).await?;
                        identity_replaced = true;
                    }
                    _ => {}
                }
                next.identity = Some(desired.identity.clone());
                action
            }
            ResourceNode::PolicyDocument => policy_document_action(desired, &state),
            ResourceNode::PolicyAttachment => {
                let action = attachment_action(desired, &state, identity_replaced);
                if action.kind != ActionKind::Unchanged {
                    engine
                        .put_role_policy(&desired.attachment, &desired.policy)
                        .await?;
                }
                next.attachment = Some(desired.attachment.clone());
                action
            }
            ResourceNode::LogSink => {
                let action = log_sink_action(desired, &state);
                if action.kind != ActionKind::Unchanged {
                    engine.ensure_log_sink(&desired.log_sink).await?;
                }
                next.log_sink = Some(desired.log_sink.clone());
                action
            }
            ResourceNode::DeployedUnit => {
                let outcome =
                    reconcile(engine, &desired.unit, &desired.bundle, state.unit.as_ref()).await?;
                let action = unit_action(desired, &outcome.plan);
                next.unit = Some(outcome.record);
                action
            }
        };

        if action.kind != ActionKind::Unchanged {
            info!("{}", action);
        }
        actions.push(action);
    }

    Ok(PassReport {
        state: next,
        actions,
        outputs: desired.outputs.clone(),
        digest: desired.bundle.digest().clone(),
    })
}
