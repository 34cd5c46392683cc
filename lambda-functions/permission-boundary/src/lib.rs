use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub const POLICY_VERSION: &str = "2012-10-17";
pub const LAMBDA_SERVICE_PRINCIPAL: &str = "lambda.amazonaws.com";
pub const LOG_STATEMENT_SID: &str = "WriteLogs";

/// Verbs granted on the log wildcard. The stream name only exists after the
/// unit's first invocation, so these are the one statement not scoped to a
/// declared locator.
pub const LOG_VERBS: [&str; 3] = [
    "logs:CreateLogGroup",
    "logs:CreateLogStream",
    "logs:PutLogEvents",
];

const BUCKET_VERBS: [&str; 3] = ["s3:ListBucket", "s3:ListBucketVersions", "s3:GetBucketLocation"];

const OBJECT_VERBS: [&str; 6] = [
    "s3:GetObject",
    "s3:GetObjectVersion",
    "s3:GetObjectTagging",
    "s3:PutObject",
    "s3:PutObjectTagging",
    "s3:DeleteObject",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("grant '{label}' declares an empty {field}")]
    EmptyLocator { label: String, field: &'static str },
    #[error("grant '{label}' has {field} '{value}' that IAM would read as a pattern")]
    InvalidLocator {
        label: String,
        field: &'static str,
        value: String,
    },
    #[error("grant label '{label}' must be ASCII letters and digits only")]
    InvalidLabel { label: String },
    #[error("grant '{label}' requests no verbs")]
    EmptyGrant { label: String },
    #[error("no resource scope is defined for verb(s): {}", .verbs.join(", "))]
    UnmappedVerbs { verbs: Vec<String> },
    #[error("statement sid '{sid}' is declared more than once")]
    DuplicateSid { sid: String },
    #[error("trust policy needs a service principal")]
    EmptyPrincipal,
}

impl PolicyError {
    /// Uniqueness violations are conflicts; everything else is malformed input.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::DuplicateSid { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VerbScope {
    Bucket,
    Object,
}

impl VerbScope {
    pub fn of(verb: &str) -> Option<Self> {
        if BUCKET_VERBS.contains(&verb) {
            Some(Self::Bucket)
        } else if OBJECT_VERBS.contains(&verb) {
            Some(Self::Object)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "Allow"),
            Self::Deny => write!(f, "Deny"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PermissionStatement {
    pub sid: String,
    pub effect: Effect,
    #[serde(rename = "Action")]
    pub actions: BTreeSet<String>,
    #[serde(rename = "Resource")]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statements: Vec<PermissionStatement>,
}

impl PolicyDocument {
    pub fn to_json_bytes(&self) -> Vec<u8> {
        // Struct fields and BTreeSet members serialize in a fixed order.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        String::from_utf8(self.to_json_bytes()).unwrap_or_default()
    }

    /// `sha256:<hex>` over the serialized document.
    pub fn digest(&self) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(self.to_json_bytes())))
    }

    pub fn statement(&self, sid: &str) -> Option<&PermissionStatement> {
        self.statements.iter().find(|s| s.sid == sid)
    }
}

/// One bucket/prefix pair and the verbs the identity needs on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketGrant {
    pub label: String,
    pub bucket: String,
    pub prefix: String,
    pub verbs: BTreeSet<String>,
}

impl BucketGrant {
    pub fn new<I, S>(
        label: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        verbs: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
            verbs: verbs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn bucket_arn(&self) -> String {
        format!("arn:aws:s3:::{}", self.bucket)
    }

    pub fn objects_arn(&self) -> String {
        format!("arn:aws:s3:::{}/{}/*", self.bucket, normalize_prefix(&self.prefix))
    }

    fn validate(&self) -> Result<(), PolicyError> {
        // The label becomes part of each statement sid.
        if self.label.is_empty() || !self.label.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PolicyError::InvalidLabel {
                label: self.label.clone(),
            });
        }
        if self.bucket.trim().is_empty() {
            return Err(PolicyError::EmptyLocator {
                label: self.label.clone(),
                field: "bucket",
            });
        }
        if normalize_prefix(&self.prefix).is_empty() {
            return Err(PolicyError::EmptyLocator {
                label: self.label.clone(),
                field: "prefix",
            });
        }
        if self.bucket.contains(['*', '?', '/']) {
            return Err(PolicyError::InvalidLocator {
                label: self.label.clone(),
                field: "bucket",
                value: self.bucket.clone(),
            });
        }
        if self.prefix.contains(['*', '?']) {
            return Err(PolicyError::InvalidLocator {
                label: self.label.clone(),
                field: "prefix",
                value: self.prefix.clone(),
            });
        }
        if self.verbs.is_empty() {
            return Err(PolicyError::EmptyGrant {
                label: self.label.clone(),
            });
        }
        Ok(())
    }
}

pub fn normalize_prefix(prefix: &str) -> &str {
    prefix.trim().trim_matches('/')
}

/// Builds the identity's policy from declared grants.
///
/// Each grant yields at most two statements, `<Label>List` on the bucket ARN
/// and `<Label>Objects` on `bucket/prefix/*`; the two scopes never share a
/// statement because their locator grammars differ. The `WriteLogs` statement
/// is always last and is the only one on `*`.
///
/// Every grant is checked before anything is emitted, and all unmapped verbs
/// across all grants are reported together.
pub fn build_policy(grants: &[BucketGrant]) -> Result<PolicyDocument, PolicyError> {
    for grant in grants {
        grant.validate()?;
    }

    let unmapped: BTreeSet<String> = grants
        .iter()
        .flat_map(|g| g.verbs.iter())
        .filter(|v| VerbScope::of(v).is_none())
        .cloned()
        .collect();
    if !unmapped.is_empty() {
        return Err(PolicyError::UnmappedVerbs {
            verbs: unmapped.into_iter().collect(),
        });
    }

    let mut statements = Vec::new();
    for grant in grants {
        let (bucket_verbs, object_verbs): (BTreeSet<String>, BTreeSet<String>) = grant
            .verbs
            .iter()
            .cloned()
            .partition(|v| VerbScope::of(v) == Some(VerbScope::Bucket));

        if !bucket_verbs.is_empty() {
            statements.push(PermissionStatement {
                sid: format!("{}List", grant.label),
                effect: Effect::Allow,
                actions: bucket_verbs,
                resources: vec![grant.bucket_arn()],
            });
        }
        if !object_verbs.is_empty() {
            statements.push(PermissionStatement {
                sid: format!("{}Objects", grant.label),
                effect: Effect::Allow,
                actions: object_verbs,
                resources: vec![grant.objects_arn()],
            });
        }
    }

    statements.push(PermissionStatement {
        sid: LOG_STATEMENT_SID.to_string(),
        effect: Effect::Allow,
        actions: LOG_VERBS.iter().map(|v| v.to_string()).collect(),
        resources: vec!["*".to_string()],
    });

    let mut seen = HashSet::new();
    for statement in &statements {
        if !seen.insert(statement.sid.as_str()) {
            return Err(PolicyError::DuplicateSid {
                sid: statement.sid.clone(),
            });
        }
    }

    debug!("Built policy with {} statements", statements.len());

    Ok(PolicyDocument {
        version: POLICY_VERSION.to_string(),
        statements,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrustStatement {
    pub effect: Effect,
    pub principal: TrustPrincipal,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrustPrincipal {
    pub service: String,
}

/// Assume-role document naming the single caller class allowed to act as the
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statements: Vec<TrustStatement>,
}

impl TrustPolicy {
    pub fn for_service(principal: &str) -> Result<Self, PolicyError> {
        if principal.trim().is_empty() {
            return Err(PolicyError::EmptyPrincipal);
        }
        Ok(Self {
            version: POLICY_VERSION.to_string(),
            statements: vec![TrustStatement {
                effect: Effect::Allow,
                principal: TrustPrincipal {
                    service: principal.to_string(),
                },
                action: "sts:AssumeRole".to_string(),
            }],
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn principal(&self) -> Option<&str> {
        self.statements.first().map(|s| s.principal.service.as_str())
    }
}

/// A principal that compute runs as. Its trust policy is fixed for the life
/// of the identity; a different trust policy means a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub trust: TrustPolicy,
}

impl Identity {
    pub fn new(name: impl Into<String>, trust: TrustPolicy) -> Self {
        Self {
            name: name.into(),
            trust,
        }
    }

    pub fn requires_replacement(&self, recorded: &Identity) -> bool {
        self.name != recorded.name || self.trust != recorded.trust
    }
}
