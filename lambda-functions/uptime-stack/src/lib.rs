pub mod error;
pub mod graph;
pub mod inputs;
pub mod ledger;
pub mod pass;
pub mod resources;
pub mod service;

pub use error::{ErrorKind, StackError};
pub use graph::{ResourceGraph, ResourceNode};
pub use inputs::{StackInputs, StackOutputs};
pub use ledger::{fetch_bundle, LedgerEngine, LedgerEntry};
pub use pass::{
    plan_pass, prepare, prepare_inputs, run_pass, ActionKind, DesiredStack, PassReport,
    PreparedStack, ProvisioningEngine, ResourceAction, StackState,
};
pub use resources::{LogSink, PolicyAttachment, LOG_RETENTION_DAYS};
pub use service::{admit_request, PassAction, Request, Response, StackService};
