use artifact_reconciler::{Architecture, RuntimeDescriptor};
use bon::Builder;
use permission_boundary::BucketGrant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::StackError;

const ENV_PREFIX: &str = "UPTIME_";

/// Declared configuration of the stack. Every field has a default, so a
/// request may override any subset of them.
#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[builder(on(String, into))]
#[serde(default, rename_all = "snake_case")]
pub struct StackInputs {
    #[builder(default = "us-east-1".to_string())]
    pub region: String,

    #[builder(default = "uptime-canary-artifacts".to_string())]
    pub artifact_bucket: String,

    #[builder(default = "canary".to_string())]
    pub artifact_prefix: String,

    #[builder(default = "chrome".to_string())]
    pub only_browser: String,

    #[builder(default = "uptime-reports".to_string())]
    pub reports_bucket: String,

    #[builder(default = "reports".to_string())]
    pub reports_prefix: String,

    #[builder(default = "Example Co".to_string())]
    pub company_name: String,

    #[builder(default = "Website".to_string())]
    pub service_name: String,

    #[builder(default = "Example Client".to_string())]
    pub client_name: String,

    #[builder(default = "Uptime you can trust".to_string())]
    pub brand_strapline: String,

    #[builder(default = 99.9)]
    pub slo_target: f64,

    #[builder(default = 3)]
    pub fail_streak: u32,

    #[builder(default = false)]
    pub treat_missing: bool,

    #[builder(default = "uptime".to_string())]
    pub name_prefix: String,

    #[builder(default = "arm64".to_string())]
    pub architecture: String,

    #[builder(default = 14)]
    pub log_retention_days: u32,

    #[builder(default = "python3.12".to_string())]
    pub runtime: String,

    #[builder(default = "app.lambda_handler".to_string())]
    pub handler: String,

    #[builder(default = 1024)]
    pub memory_mb: u32,

    #[builder(default = 300)]
    pub timeout_secs: u32,

    #[builder(default = 1024)]
    pub ephemeral_storage_mb: u32,
}

impl Default for StackInputs {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StackOutputs {
    pub function_name: String,
    pub reports_bucket: String,
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &'static str, field: &'static str, default: T) -> Result<T, StackError> {
    match std::env::var(format!("{}{}", ENV_PREFIX, name)) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| StackError::invalid(field, format!("cannot parse '{}'", raw))),
        Err(_) => Ok(default),
    }
}

impl StackInputs {
    /// Reads `UPTIME_<FIELD>` variables, falling back to the defaults.
    pub fn from_env() -> Result<Self, StackError> {
        let d = Self::default();
        Ok(Self {
            region: env_string("REGION", d.region),
            artifact_bucket: env_string("ARTIFACT_BUCKET", d.artifact_bucket),
            artifact_prefix: env_string("ARTIFACT_PREFIX", d.artifact_prefix),
            only_browser: env_string("ONLY_BROWSER", d.only_browser),
            reports_bucket: env_string("REPORTS_BUCKET", d.reports_bucket),
            reports_prefix: env_string("REPORTS_PREFIX", d.reports_prefix),
            company_name: env_string("COMPANY_NAME", d.company_name),
            service_name: env_string("SERVICE_NAME", d.service_name),
            client_name: env_string("CLIENT_NAME", d.client_name),
            brand_strapline: env_string("BRAND_STRAPLINE", d.brand_strapline),
            slo_target: env_parse("SLO_TARGET", "slo_target", d.slo_target)?,
            fail_streak: env_parse("FAIL_STREAK", "fail_streak", d.fail_streak)?,
            treat_missing: env_parse("TREAT_MISSING", "treat_missing", d.treat_missing)?,
            name_prefix: env_string("NAME_PREFIX", d.name_prefix),
            architecture: env_string("ARCHITECTURE", d.architecture),
            log_retention_days: env_parse(
                "LOG_RETENTION_DAYS",
                "log_retention_days",
                d.log_retention_days,
            )?,
            runtime: env_string("RUNTIME", d.runtime),
            handler: env_string("HANDLER", d.handler),
            memory_mb: env_parse("MEMORY_MB", "memory_mb", d.memory_mb)?,
            timeout_secs: env_parse("TIMEOUT_SECS", "timeout_secs", d.timeout_secs)?,
            ephemeral_storage_mb: env_parse(
                "EPHEMERAL_STORAGE_MB",
                "ephemeral_storage_mb",
                d.ephemeral_storage_mb,
            )?,
        })
    }

    /// Checks the scalar inputs. The architecture selector is checked first so
    /// a bad selector is reported before any policy is built.
    pub fn validate(&self) -> Result<Architecture, StackError> {
        let architecture = Architecture::from_str(&self.architecture)
            .map_err(|e| StackError::invalid("architecture", e.to_string()))?;

        if self.name_prefix.is_empty()
            || !self
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StackError::invalid(
                "name_prefix",
                format!("'{}' must be non-empty [A-Za-z0-9-_]", self.name_prefix),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(StackError::invalid("region", "must not be empty"));
        }
        if !(self.slo_target > 0.0 && self.slo_target <= 100.0) {
            return Err(StackError::invalid(
                "slo_target",
                format!("{} is outside (0, 100]", self.slo_target),
            ));
        }
        if self.fail_streak == 0 {
            return Err(StackError::invalid("fail_streak", "must be at least 1"));
        }
        Ok(architecture)
    }

    pub fn function_name(&self) -> String {
        format!("{}-uptime-lambda", self.name_prefix)
    }

    pub fn role_name(&self) -> String {
        format!("{}-role", self.function_name())
    }

    pub fn policy_name(&self) -> String {
        format!("{}-policy", self.function_name())
    }

    pub fn log_group_name(&self) -> String {
        format!("/aws/lambda/{}", self.function_name())
    }

    pub fn default_deploy_bucket(&self) -> String {
        format!("{}-deploy-artifacts", self.name_prefix)
    }

    /// Variables handed to the report function.
    pub fn environment(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("ARTIFACT_BUCKET".to_string(), self.artifact_bucket.clone()),
            ("ARTIFACT_PREFIX".to_string(), self.artifact_prefix.clone()),
            ("ONLY_BROWSER".to_string(), self.only_browser.clone()),
            ("REPORTS_BUCKET".to_string(), self.reports_bucket.clone()),
            ("REPORTS_PREFIX".to_string(), self.reports_prefix.clone()),
            ("COMPANY_NAME".to_string(), self.company_name.clone()),
            ("SERVICE_NAME".to_string(), self.service_name.clone()),
            ("CLIENT_NAME".to_string(), self.client_name.clone()),
            ("BRAND_STRAPLINE".to_string(), self.brand_strapline.clone()),
            ("SLO_TARGET".to_string(), self.slo_target.to_string()),
            ("FAIL_STREAK".to_string(), self.fail_streak.to_string()),
            ("TREAT_MISSING".to_string(), self.treat_missing.to_string()),
        ])
    }

    /// Read access to the canary artifacts, read/write access to the reports.
    pub fn grants(&self) -> Vec<BucketGrant> {
        vec![
            BucketGrant::new(
                "Artifacts",
                self.artifact_bucket.as_str(),
                self.artifact_prefix.as_str(),
                ["s3:ListBucket", "s3:GetObject"],
            ),
            BucketGrant::new(
                "Reports",
                self.reports_bucket.as_str(),
                self.reports_prefix.as_str(),
                ["s3:ListBucket", "s3:GetObject", "s3:PutObject"],
            ),
        ]
    }

    pub fn descriptor(&self, architecture: Architecture) -> RuntimeDescriptor {
        RuntimeDescriptor::builder()
            .runtime(self.runtime.as_str())
            .handler(self.handler.as_str())
            .architecture(architecture)
            .memory_mb(self.memory_mb)
            .timeout_secs(self.timeout_secs)
            .ephemeral_storage_mb(self.ephemeral_storage_mb)
            .build()
    }

    pub fn outputs(&self) -> StackOutputs {
        StackOutputs {
            function_name: self.function_name(),
            reports_bucket: self.reports_bucket.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let inputs = StackInputs::default();
        assert_eq!(inputs.region, "us-east-1");
        assert_eq!(inputs.function_name(), "uptime-uptime-lambda");
        assert_eq!(inputs.role_name(), "uptime-uptime-lambda-role");
        assert_eq!(inputs.log_group_name(), "/aws/lambda/uptime-uptime-lambda");
        assert_eq!(inputs.validate().unwrap(), Architecture::Arm64);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"name_prefix": "acme", "slo_target": 99.5, "architecture": "x86_64"}"#;
        let inputs: StackInputs = serde_json::from_str(json).unwrap();
        assert_eq!(inputs.name_prefix, "acme");
        assert_eq!(inputs.slo_target, 99.5);
        assert_eq!(inputs.reports_bucket, "uptime-reports");
        assert_eq!(inputs.validate().unwrap(), Architecture::X86_64);
    }

    #[test]
    fn test_environment_stringification() {
        let inputs = StackInputs::builder()
            .slo_target(99.0)
            .fail_streak(5)
            .treat_missing(true)
            .build();
        let env = inputs.environment();
        assert_eq!(env.len(), 12);
        assert_eq!(env["SLO_TARGET"], "99");
        assert_eq!(env["FAIL_STREAK"], "5");
        assert_eq!(env["TREAT_MISSING"], "true");
        assert_eq!(env["ONLY_BROWSER"], "chrome");
    }

    #[test]
    fn test_invalid_architecture() {
        let inputs = StackInputs::builder().architecture("sparc").build();
        let err = inputs.validate().unwrap_err();
        assert!(matches!(
            err,
            StackError::InvalidInput {
                field: "architecture",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_scalars() {
        assert!(StackInputs::builder().slo_target(0.0).build().validate().is_err());
        assert!(StackInputs::builder().slo_target(100.5).build().validate().is_err());
        assert!(StackInputs::builder().slo_target(100.0).build().validate().is_ok());
        assert!(StackInputs::builder().fail_streak(0).build().validate().is_err());
        assert!(StackInputs::builder().name_prefix("bad prefix").build().validate().is_err());
        assert!(StackInputs::builder().name_prefix("").build().validate().is_err());
    }

    #[test]
    fn test_grants_cover_both_buckets() {
        let grants = StackInputs::default().grants();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].bucket, "uptime-canary-artifacts");
        assert!(!grants[0].verbs.contains("s3:PutObject"));
        assert!(grants[1].verbs.contains("s3:PutObject"));
    }

    #[test]
    fn test_descriptor_from_inputs() {
        let inputs = StackInputs::builder().memory_mb(512).build();
        let descriptor = inputs.descriptor(Architecture::X86_64);
        assert_eq!(descriptor.memory_mb, 512);
        assert_eq!(descriptor.architecture, Architecture::X86_64);
        assert_eq!(descriptor.handler, "app.lambda_handler");
    }
}
