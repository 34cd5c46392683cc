use artifact_reconciler::{
    ArtifactBundle, CodeLocation, EngineError, UnitEngine, UnitRecord,
};
use aws_sdk_dynamodb::{
    error::DisplayErrorContext,
    operation::put_item::PutItemError,
    types::{AttributeValue, ReturnValuesOnConditionCheckFailure},
    Client as DynamoClient,
};
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use permission_boundary::{Identity, PolicyDocument};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_dynamo::{from_item, to_item};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::pass::{DesiredStack, ProvisioningEngine, StackState};
use crate::resources::{LogSink, PolicyAttachment};

// One item per resource in the ledger table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub resource_id: String,
    pub kind: String,
    pub revision: Option<u64>,
    pub digest: Option<String>,
    pub body: String,
    pub updated_at: String,
}

pub fn identity_id(name: &str) -> String {
    format!("identity#{}", name)
}

pub fn attachment_id(identity: &str) -> String {
    format!("attachment#{}", identity)
}

pub fn log_sink_id(name: &str) -> String {
    format!("log_sink#{}", name)
}

pub fn unit_id(name: &str) -> String {
    format!("unit#{}", name)
}

pub fn bundle_key(unit: &str, bundle: &ArtifactBundle) -> String {
    format!("bundles/{}/{}.bundle", unit, bundle.digest().hex())
}

/// Whether the item a failed conditional put found is `record` itself, as
/// happens when an earlier attempt of the same put committed but its response
/// was lost.
fn already_committed(stored: Option<&HashMap<String, AttributeValue>>, record: &UnitRecord) -> bool {
    let Some(item) = stored else {
        return false;
    };
    let entry: Result<LedgerEntry, _> = from_item(item.clone());
    match entry {
        Ok(entry) => {
            entry.revision == Some(record.revision)
                && entry.digest.as_deref() == Some(record.digest.as_str())
        }
        Err(_) => false,
    }
}

fn entry<T: Serialize>(
    resource_id: String,
    kind: &str,
    revision: Option<u64>,
    digest: Option<String>,
    body: &T,
) -> Result<LedgerEntry, EngineError> {
    let body = serde_json::to_string(body)
        .map_err(|e| EngineError::Transient(format!("cannot encode {}: {}", kind, e)))?;
    Ok(LedgerEntry {
        resource_id,
        kind: kind.to_string(),
        revision,
        digest,
        body,
        updated_at: Utc::now().to_rfc3339(),
    })
}

/// Engine backed by the deployment ledger: bundles in S3, one DynamoDB item
/// per resource recording the state the executor must converge to.
pub struct LedgerEngine {
    pub dynamo_client: DynamoClient,
    pub s3_client: S3Client,
    pub ledger_table: String,
    pub deploy_bucket: String,
}

impl LedgerEngine {
    pub fn new(
        dynamo_client: DynamoClient,
        s3_client: S3Client,
        ledger_table: impl Into<String>,
        deploy_bucket: impl Into<String>,
    ) -> Self {
        Self {
            dynamo_client,
            s3_client,
            ledger_table: ledger_table.into(),
            deploy_bucket: deploy_bucket.into(),
        }
    }

    async fn put_entry(&self, entry: LedgerEntry) -> Result<(), EngineError> {
        let item = to_item(entry).map_err(|e| EngineError::Transient(e.to_string()))?;
        self.dynamo_client
            .put_item()
            .table_name(&self.ledger_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| EngineError::Transient(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn get_body<T: DeserializeOwned>(&self, resource_id: &str) -> Result<Option<T>, EngineError> {
        let result = self
            .dynamo_client
            .get_item()
            .table_name(&self.ledger_table)
            .key("resource_id", AttributeValue::S(resource_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| EngineError::Transient(DisplayErrorContext(&e).to_string()))?;

        let Some(item) = result.item else {
            return Ok(None);
        };
        let entry: LedgerEntry =
            from_item(item).map_err(|e| EngineError::Transient(e.to_string()))?;
        let body = serde_json::from_str(&entry.body).map_err(|e| {
            EngineError::Transient(format!("ledger entry {} is unreadable: {}", resource_id, e))
        })?;
        Ok(Some(body))
    }

    /// Reads back the last-known state of every resource in `desired`.
    pub async fn load_state(&self, desired: &DesiredStack) -> Result<StackState, EngineError> {
        Ok(StackState {
            identity: self.get_body(&identity_id(&desired.identity.name)).await?,
            attachment: self
                .get_body(&attachment_id(&desired.attachment.identity))
                .await?,
            log_sink: self.get_body(&log_sink_id(&desired.log_sink.name)).await?,
            unit: self.get_body(&unit_id(&desired.unit.name)).await?,
        })
    }
}

impl UnitEngine for LedgerEngine {
    async fn upload_bundle(
        &self,
        unit: &str,
        bundle: &ArtifactBundle,
    ) -> Result<CodeLocation, EngineError> {
        let key = bundle_key(unit, bundle);

        self.s3_client
            .put_object()
            .bucket(&self.deploy_bucket)
            .key(&key)
            .content_type("application/octet-stream")
            .metadata("digest", bundle.digest().as_str())
            .body(bundle.package().into())
            .send()
            .await
            .map_err(|e| EngineError::Transient(DisplayErrorContext(&e).to_string()))?;

        Ok(CodeLocation {
            bucket: self.deploy_bucket.clone(),
            key,
        })
    }

    async fn swap_unit(
        &self,
        expected_revision: Option<u64>,
        record: &UnitRecord,
    ) -> Result<(), EngineError> {
        let entry = entry(
            unit_id(&record.name),
            "unit",
            Some(record.revision),
            Some(record.digest.to_string()),
            record,
        )?;
        let item = to_item(entry).map_err(|e| EngineError::Transient(e.to_string()))?;

        let mut request = self
            .dynamo_client
            .put_item()
            .table_name(&self.ledger_table)
            .set_item(Some(item))
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld);

        request = match expected_revision {
            None => request.condition_expression("attribute_not_exists(resource_id)"),
            Some(revision) => request
                .condition_expression("revision = :expected")
                .expression_attribute_values(":expected", AttributeValue::N(revision.to_string())),
        };

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) => match e.as_service_error() {
                Some(PutItemError::ConditionalCheckFailedException(failed)) => {
                    if already_committed(failed.item(), record) {
                        info!(
                            "Unit {} already at revision {} from a retried write",
                            record.name, record.revision
                        );
                        return Ok(());
                    }
                    warn!(
                        "Unit {} moved past revision {:?} during this pass",
                        record.name, expected_revision
                    );
                    Err(EngineError::Conflict(format!(
                        "unit {} is no longer at revision {:?}",
                        record.name, expected_revision
                    )))
                }
                _ => Err(EngineError::Transient(DisplayErrorContext(&e).to_string())),
            },
        }
    }
}

impl ProvisioningEngine for LedgerEngine {
    async fn ensure_identity(&self, identity: &Identity, replace: bool) -> Result<(), EngineError> {
        if replace {
            info!("Recording replacement of identity {}", identity.name);
        }
        self.put_entry(entry(
            identity_id(&identity.name),
            "identity",
            None,
            None,
            identity,
        )?)
        .await
    }

    async fn put_role_policy(
        &self,
        attachment: &PolicyAttachment,
        policy: &PolicyDocument,
    ) -> Result<(), EngineError> {
        // The attachment record carries the document so the executor applies
        // exactly the bytes the digest was computed over.
        self.put_entry(entry(
            format!("policy#{}", attachment.policy_name),
            "policy_document",
            None,
            Some(attachment.policy_digest.clone()),
            policy,
        )?)
        .await?;
        self.put_entry(entry(
            attachment_id(&attachment.identity),
            "attachment",
            None,
            Some(attachment.policy_digest.clone()),
            attachment,
        )?)
        .await
    }

    async fn ensure_log_sink(&self, sink: &LogSink) -> Result<(), EngineError> {
        self.put_entry(entry(log_sink_id(&sink.name), "log_sink", None, None, sink)?)
            .await
    }
}

/// Packages every object under `prefix` into one bundle, keyed by its path
/// relative to the prefix.
pub async fn fetch_bundle(
    s3_client: &S3Client,
    bucket: &str,
    prefix: &str,
) -> anyhow::Result<ArtifactBundle> {
    let mut entries = Vec::new();
    let mut continuation_token = None;

    loop {
        let mut list_request = s3_client.list_objects_v2().bucket(bucket).prefix(prefix);
        if let Some(token) = continuation_token {
            list_request = list_request.continuation_token(token);
        }
        let result = list_request.send().await?;

        for object in result.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            if key.ends_with('/') {
                continue;
            }
            let body = s3_client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await?
                .body
                .collect()
                .await?
                .into_bytes();
            let path = key.strip_prefix(prefix).unwrap_or(key).trim_start_matches('/');
            entries.push((path.to_string(), body.to_vec()));
        }

        if result.is_truncated() != Some(true) {
            break;
        }
        continuation_token = result.next_continuation_token().map(str::to_string);
    }

    info!(
        "Read {} source file(s) from s3://{}/{}",
        entries.len(),
        bucket,
        prefix
    );
    Ok(ArtifactBundle::from_entries(entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_ids() {
        assert_eq!(identity_id("role"), "identity#role");
        assert_eq!(attachment_id("role"), "attachment#role");
        assert_eq!(log_sink_id("/aws/lambda/unit"), "log_sink#/aws/lambda/unit");
        assert_eq!(unit_id("unit"), "unit#unit");
    }

    #[test]
    fn test_bundle_key_is_content_addressed() {
        let bundle = ArtifactBundle::single("app.py", b"v1".to_vec()).unwrap();
        let key = bundle_key("uptime-uptime-lambda", &bundle);
        assert!(key.starts_with("bundles/uptime-uptime-lambda/"));
        assert!(key.ends_with(&format!("{}.bundle", bundle.digest().hex())));
    }

    #[test]
    fn test_ledger_entry_item() {
        let sink = LogSink::new("/aws/lambda/unit", 14).unwrap();
        let entry = entry(log_sink_id(&sink.name), "log_sink", Some(3), None, &sink).unwrap();
        let item: HashMap<String, AttributeValue> = to_item(entry.clone()).unwrap();

        assert_eq!(
            item.get("resource_id"),
            Some(&AttributeValue::S("log_sink#/aws/lambda/unit".to_string()))
        );
        assert_eq!(item.get("revision"), Some(&AttributeValue::N("3".to_string())));

        let back: LedgerEntry = from_item(item).unwrap();
        assert_eq!(back, entry);
        let parsed: LogSink = serde_json::from_str(&back.body).unwrap();
        assert_eq!(parsed, sink);
    }

    fn unit_record(revision: u64, source: &[u8]) -> UnitRecord {
        let bundle = ArtifactBundle::single("app.py", source.to_vec()).unwrap();
        UnitRecord {
            name: "uptime-uptime-lambda".to_string(),
            role: "uptime-uptime-lambda-role".to_string(),
            log_sink: "/aws/lambda/uptime-uptime-lambda".to_string(),
            descriptor: Default::default(),
            environment: Default::default(),
            code: CodeLocation {
                bucket: "deploy".to_string(),
                key: bundle_key("uptime-uptime-lambda", &bundle),
            },
            digest: bundle.digest().clone(),
            revision,
            deployed_at: "2025-01-06T12:00:00Z".to_string(),
        }
    }

    fn stored_item(record: &UnitRecord) -> HashMap<String, AttributeValue> {
        let entry = entry(
            unit_id(&record.name),
            "unit",
            Some(record.revision),
            Some(record.digest.to_string()),
            record,
        )
        .unwrap();
        to_item(entry).unwrap()
    }

    #[test]
    fn test_retried_swap_recognizes_own_write() {
        let record = unit_record(4, b"v2");
        assert!(already_committed(Some(&stored_item(&record)), &record));
    }

    #[test]
    fn test_other_writer_is_a_conflict() {
        let record = unit_record(4, b"v2");

        let newer = unit_record(5, b"v2");
        assert!(!already_committed(Some(&stored_item(&newer)), &record));

        let same_revision_other_code = unit_record(4, b"v3");
        assert!(!already_committed(
            Some(&stored_item(&same_revision_other_code)),
            &record
        ));

        assert!(!already_committed(None, &record));
    }
}
