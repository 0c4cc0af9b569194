//! AWS Secrets Manager target store and the Roles Anywhere credential broker.
//!
//! The target store holds no long-lived AWS identity of its own: every call
//! is made with the short-lived session credentials the broker obtained
//! through the certificate trust exchange.

pub mod rolesanywhere;

use std::env;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use aws_sdk_secretsmanager::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_secretsmanager::error::SdkError;
use kvrep_core::{Error, SessionCredentials, TargetStore};

pub use rolesanywhere::{RolesAnywhereBroker, RolesAnywhereConfig};

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct TargetConfig {
    pub region: String,
    pub secret_prefix: String,
    pub endpoint: Option<String>,
}

impl TargetConfig {
    pub fn from_env() -> Result<Self> {
        let region = env::var("AWS_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string());
        let secret_prefix = env::var("AWS_SECRET_PREFIX").unwrap_or_default();
        let endpoint = env::var("AWS_SM_ENDPOINT")
            .ok()
            .filter(|value| !value.trim().is_empty());
        Ok(Self {
            region,
            secret_prefix,
            endpoint,
        })
    }

    /// Deterministic source-name to target-name mapping: prefix + name, or
    /// identity when no prefix is configured.
    pub fn target_name(&self, name: &str) -> String {
        if self.secret_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}{}", self.secret_prefix, name)
        }
    }
}

/// Secrets Manager target store.
///
/// The SDK client is rebuilt whenever the session credentials rotate and
/// cached in between, keyed by access key id.
pub struct SecretsManagerTarget {
    config: TargetConfig,
    cached: Mutex<Option<(String, SecretsManagerClient)>>,
}

impl SecretsManagerTarget {
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(TargetConfig::from_env().context(
            "failed to load target store configuration",
        )?))
    }

    pub fn new(config: TargetConfig) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    fn client_for(&self, credentials: &SessionCredentials) -> SecretsManagerClient {
        let mut cached = self.cached.lock().expect("client cache poisoned");
        if let Some((key_id, client)) = cached.as_ref() {
            if *key_id == credentials.access_key_id {
                return client.clone();
            }
        }

        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            Some(credentials.session_token.clone()),
            Some(credentials.expires_at.into()),
            "kvrep-rolesanywhere",
        );
        let mut builder = aws_sdk_secretsmanager::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()))
            .credentials_provider(provider);
        if let Some(endpoint) = self.config.endpoint.as_deref() {
            builder = builder.endpoint_url(endpoint);
        }
        let client = SecretsManagerClient::from_conf(builder.build());
        *cached = Some((credentials.access_key_id.clone(), client.clone()));
        client
    }
}

#[async_trait]
impl TargetStore for SecretsManagerTarget {
    async fn upsert(
        &self,
        name: &str,
        value: &str,
        credentials: &SessionCredentials,
    ) -> kvrep_core::Result<()> {
        let client = self.client_for(credentials);
        let target_name = self.config.target_name(name);

        let exists = match client
            .describe_secret()
            .secret_id(&target_name)
            .send()
            .await
        {
            Ok(_) => true,
            Err(err) if is_not_found(&err) => false,
            Err(err) => return Err(target_error("describe_secret", err)),
        };

        if !exists {
            match client
                .create_secret()
                .name(&target_name)
                .secret_string(value)
                .send()
                .await
            {
                Ok(_) => {
                    tracing::debug!(secret = %target_name, "created target secret");
                    return Ok(());
                }
                Err(err) => {
                    if let SdkError::ServiceError(context) = &err {
                        if context.err().is_resource_exists_exception() {
                            // lost the create race; replace the value instead
                            tracing::debug!(secret = %target_name, "create raced, falling back to put");
                        } else {
                            return Err(target_error("create_secret", err));
                        }
                    } else {
                        return Err(target_error("create_secret", err));
                    }
                }
            }
        }

        client
            .put_secret_value()
            .secret_id(&target_name)
            .secret_string(value)
            .send()
            .await
            .map_err(|err| target_error("put_secret_value", err))?;
        tracing::debug!(secret = %target_name, "put new target secret version");
        Ok(())
    }
}

fn is_not_found<T>(err: &SdkError<T>) -> bool
where
    T: aws_smithy_types::error::metadata::ProvideErrorMetadata + Send + Sync + std::fmt::Debug,
{
    if let SdkError::ServiceError(context) = err {
        return context.err().code() == Some("ResourceNotFoundException");
    }
    false
}

fn target_error<T>(operation: &str, err: SdkError<T>) -> Error
where
    T: std::fmt::Display,
{
    Error::Target(format!("{operation} failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_env(key: &str, value: &str) {
        unsafe { env::set_var(key, value) };
    }

    fn clear_env(key: &str) {
        unsafe { env::remove_var(key) };
    }

    #[test]
    fn prefix_mapping_prepends_when_configured() {
        let config = TargetConfig {
            region: DEFAULT_REGION.into(),
            secret_prefix: "p-".into(),
            endpoint: None,
        };
        assert_eq!(config.target_name("alpha"), "p-alpha");
    }

    #[test]
    fn prefix_mapping_defaults_to_identity() {
        let config = TargetConfig {
            region: DEFAULT_REGION.into(),
            secret_prefix: String::new(),
            endpoint: None,
        };
        assert_eq!(config.target_name("alpha"), "alpha");
    }

    #[test]
    #[serial]
    fn config_defaults_region_and_prefix() {
        clear_env("AWS_REGION");
        clear_env("AWS_SECRET_PREFIX");
        set_env("AWS_SM_ENDPOINT", "  ");

        let config = TargetConfig::from_env().expect("config loads");
        assert_eq!(config.region, DEFAULT_REGION);
        assert!(config.secret_prefix.is_empty());
        assert!(config.endpoint.is_none(), "blank endpoint treated as unset");
    }

    #[tokio::test]
    async fn upsert_bubbles_transport_errors() {
        let target = SecretsManagerTarget::new(TargetConfig {
            region: DEFAULT_REGION.into(),
            secret_prefix: String::new(),
            endpoint: Some("http://127.0.0.1:9".into()),
        });
        let credentials = SessionCredentials {
            access_key_id: "AKIDTEST".into(),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(30),
        };

        let err = target
            .upsert("alpha", "value", &credentials)
            .await
            .expect_err("nothing listens on the endpoint");
        assert!(matches!(err, Error::Target(_)));
    }

    #[test]
    #[serial]
    fn config_honours_overrides() {
        set_env("AWS_REGION", "eu-west-1");
        set_env("AWS_SECRET_PREFIX", "repl-");
        set_env("AWS_SM_ENDPOINT", "http://127.0.0.1:4566");

        let config = TargetConfig::from_env().expect("config loads");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.target_name("alpha"), "repl-alpha");
        assert_eq!(config.endpoint.as_deref(), Some("http://127.0.0.1:4566"));

        clear_env("AWS_REGION");
        clear_env("AWS_SECRET_PREFIX");
        clear_env("AWS_SM_ENDPOINT");
    }
}
