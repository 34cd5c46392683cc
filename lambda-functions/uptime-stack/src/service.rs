use aws_config::BehaviorVersion;
use aws_sdk_cloudwatch::{
    types::{MetricDatum, StandardUnit},
    Client as CloudWatchClient,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use lambda_runtime::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

use crate::error::StackError;
use crate::inputs::StackInputs;
use crate::ledger::{fetch_bundle, LedgerEngine};
use crate::pass::{plan_pass, prepare_inputs, run_pass, PassReport, PreparedStack};

pub const METRICS_NAMESPACE: &str = "UptimeStack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PassAction {
    #[default]
    Plan,
    Apply,
    /// Same as `apply`.
    Run,
}

impl PassAction {
    pub fn mutates(&self) -> bool {
        matches!(self, Self::Apply | Self::Run)
    }
}

impl fmt::Display for PassAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Apply => write!(f, "apply"),
            Self::Run => write!(f, "run"),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Request {
    #[serde(default)]
    pub action: PassAction,
    pub note: Option<String>,
    pub inputs: Option<StackInputs>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub status: String,
    pub action: PassAction,
    pub note: Option<String>,
    pub function_name: String,
    pub reports_bucket: String,
    pub digest: Option<String>,
    pub actions: Vec<String>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl Response {
    pub fn from_report(action: PassAction, note: Option<String>, report: &PassReport) -> Self {
        Self {
            status: "success".to_string(),
            action,
            note,
            function_name: report.outputs.function_name.clone(),
            reports_bucket: report.outputs.reports_bucket.clone(),
            digest: Some(report.digest.to_string()),
            actions: report.actions.iter().map(|a| a.to_string()).collect(),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn rejected(
        action: PassAction,
        note: Option<String>,
        inputs: &StackInputs,
        err: &StackError,
    ) -> Self {
        Self {
            status: "rejected".to_string(),
            action,
            note,
            function_name: inputs.function_name(),
            reports_bucket: inputs.reports_bucket.clone(),
            digest: None,
            actions: Vec::new(),
            error: Some(format!("{}: {}", err.kind(), err)),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Validates a request's inputs before anything is read from the provider. A
/// rejected request comes back as the response to return.
pub fn admit_request(request: &Request, defaults: &StackInputs) -> Result<PreparedStack, Response> {
    let inputs = request.inputs.as_ref().unwrap_or(defaults);
    info!(
        "Running {} for {} ({})",
        request.action,
        inputs.function_name(),
        request.note.as_deref().unwrap_or("no note")
    );

    prepare_inputs(inputs).map_err(|e| {
        warn!("Rejected {}: {}", request.action, e);
        Response::rejected(request.action, request.note.clone(), inputs, &e)
    })
}

pub struct StackService {
    engine: LedgerEngine,
    cloudwatch_client: CloudWatchClient,
    default_inputs: StackInputs,
    source_bucket: String,
    source_prefix: String,
}

impl StackService {
    pub async fn new() -> Result<Self, Error> {
        let default_inputs = StackInputs::from_env()?;

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(default_inputs.region.clone()))
            .load()
            .await;

        let deploy_bucket = std::env::var("DEPLOY_BUCKET")
            .unwrap_or_else(|_| default_inputs.default_deploy_bucket());
        let ledger_table =
            std::env::var("LEDGER_TABLE").unwrap_or_else(|_| "uptime-stack-ledger".to_string());
        let source_bucket = std::env::var("SOURCE_BUCKET").unwrap_or_else(|_| deploy_bucket.clone());
        let source_prefix =
            std::env::var("SOURCE_PREFIX").unwrap_or_else(|_| "uptime-lambda/".to_string());

        Ok(Self {
            engine: LedgerEngine::new(
                DynamoClient::new(&config),
                S3Client::new(&config),
                ledger_table,
                deploy_bucket,
            ),
            cloudwatch_client: CloudWatchClient::new(&config),
            default_inputs,
            source_bucket,
            source_prefix,
        })
    }

    pub async fn publish_metrics(&self, report: &PassReport) -> Result<(), Error> {
        let timestamp = aws_sdk_cloudwatch::primitives::DateTime::from(std::time::SystemTime::now());
        let metrics = vec![
            MetricDatum::builder()
                .metric_name("ResourcesChanged")
                .value(report.changed() as f64)
                .unit(StandardUnit::Count)
                .timestamp(timestamp.clone())
                .build(),
            MetricDatum::builder()
                .metric_name("UnitReplaced")
                .value(if report.unit_replaced() { 1.0 } else { 0.0 })
                .unit(StandardUnit::None)
                .timestamp(timestamp)
                .build(),
        ];

        info!("Publishing {} metrics to CloudWatch", metrics.len());

        match self
            .cloudwatch_client
            .put_metric_data()
            .namespace(METRICS_NAMESPACE)
            .set_metric_data(Some(metrics))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to publish metrics: {}", e);
                Err(Error::from(e))
            }
        }
    }

    pub async fn handle_request(&self, request: Request) -> Result<Response, Error> {
        let prepared = match admit_request(&request, &self.default_inputs) {
            Ok(prepared) => prepared,
            Err(response) => return Ok(response),
        };

        let bundle = fetch_bundle(
            &self.engine.s3_client,
            &self.source_bucket,
            &self.source_prefix,
        )
        .await?;
        let desired = prepared.with_bundle(bundle);
        let inputs = request
            .inputs
            .clone()
            .unwrap_or_else(|| self.default_inputs.clone());

        let state = self.engine.load_state(&desired).await?;

        if !request.action.mutates() {
            let report = PassReport {
                actions: plan_pass(&desired, &state),
                state,
                outputs: desired.outputs.clone(),
                digest: desired.bundle.digest().clone(),
            };
            return Ok(Response::from_report(request.action, request.note, &report));
        }

        let report = match run_pass(&self.engine, &desired, state).await {
            Ok(report) => report,
            Err(e) if e.is_rejection() => {
                warn!("Rejected {}: {}", request.action, e);
                return Ok(Response::rejected(request.action, request.note, &inputs, &e));
            }
            Err(e) => {
                error!("Pass failed: {}", e);
                return Err(Error::from(e));
            }
        };

        // Already logged by publish_metrics.
        let _ = self.publish_metrics(&report).await;

        Ok(Response::from_report(request.action, request.note, &report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialization() {
        let json = r#"{"action":"run","note":"manual trigger"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.action, PassAction::Run);
        assert!(request.action.mutates());
        assert_eq!(request.note, Some("manual trigger".to_string()));
        assert!(request.inputs.is_none());

        let request_empty: Request = serde_json::from_str("{}").unwrap();
        assert_eq!(request_empty.action, PassAction::Plan);
        assert!(!request_empty.action.mutates());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let json = r#"{"action":"destroy"}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn test_invalid_request_rejected_before_bundle_read() {
        let request = Request {
            action: PassAction::Apply,
            note: Some("bad selector".to_string()),
            inputs: Some(StackInputs::builder().architecture("sparc").build()),
        };
        let response = admit_request(&request, &StackInputs::default()).unwrap_err();

        assert_eq!(response.status, "rejected");
        assert_eq!(response.note, Some("bad selector".to_string()));
        assert!(response.error.unwrap().starts_with("validation: "));
    }

    #[test]
    fn test_default_inputs_admitted() {
        let prepared = admit_request(&Request::default(), &StackInputs::default()).unwrap();
        assert_eq!(prepared.unit.name, "uptime-uptime-lambda");
        assert_eq!(prepared.order.len(), 5);
    }

    #[test]
    fn test_rejected_response() {
        let inputs = StackInputs::builder().architecture("mips").build();
        let err = inputs.validate().unwrap_err();
        let response = Response::rejected(PassAction::Apply, None, &inputs, &err);

        assert_eq!(response.status, "rejected");
        assert_eq!(response.function_name, "uptime-uptime-lambda");
        assert!(response.error.unwrap().starts_with("validation: "));
        assert!(response.actions.is_empty());
    }
}
