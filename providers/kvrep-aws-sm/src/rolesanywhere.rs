//! IAM Roles Anywhere credential broker.
//!
//! Exchanges a long-lived certificate/key pair held in the source vault for
//! short-lived session credentials by invoking the `aws_signing_helper`
//! binary, and caches the result until near-expiry. The cache lock is held
//! across the exchange, so concurrent callers that observe an expired cache
//! coalesce onto a single helper invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kvrep_core::{Clock, CredentialBroker, Error, Result, SessionCredentials, SourceStore};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

const DEFAULT_HELPER_PATH: &str = "/usr/local/bin/aws_signing_helper";
const DEFAULT_CERT_SECRET: &str = "aws-ra-cert-pem";
const DEFAULT_KEY_SECRET: &str = "aws-ra-key-pem";
const DEFAULT_CHAIN_SECRET: &str = "aws-ra-chain-pem";
const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 20;
const DEFAULT_CREDENTIAL_TTL_SECS: i64 = 1800;
/// Refresh this long before the reported expiry.
const SAFETY_MARGIN_SECS: i64 = 60;
/// Upper bound on helper stdout; a credential document is a few hundred bytes.
const MAX_HELPER_OUTPUT: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct RolesAnywhereConfig {
    pub region: String,
    pub trust_anchor_arn: String,
    pub profile_arn: String,
    pub role_arn: String,
    pub helper_path: PathBuf,
    pub cert_secret: String,
    pub key_secret: String,
    pub chain_secret: String,
    pub exchange_timeout: Duration,
    /// Cache window used when the helper omits an expiration.
    pub fallback_ttl: chrono::Duration,
}

impl RolesAnywhereConfig {
    pub fn from_env() -> Result<Self> {
        let require = |key: &str| {
            std::env::var(key).map_err(|_| Error::Config(format!("missing {key}")))
        };

        let region =
            std::env::var("AWS_REGION").unwrap_or_else(|_| super::DEFAULT_REGION.to_string());
        let trust_anchor_arn = require("AWS_RA_TRUST_ANCHOR_ARN")?;
        let profile_arn = require("AWS_RA_PROFILE_ARN")?;
        let role_arn = require("AWS_RA_ROLE_ARN")?;

        let helper_path = std::env::var("AWS_SIGNING_HELPER_PATH")
            .unwrap_or_else(|_| DEFAULT_HELPER_PATH.to_string())
            .into();
        let cert_secret = std::env::var("AWS_RA_CERT_SECRET_NAME")
            .unwrap_or_else(|_| DEFAULT_CERT_SECRET.to_string());
        let key_secret = std::env::var("AWS_RA_KEY_SECRET_NAME")
            .unwrap_or_else(|_| DEFAULT_KEY_SECRET.to_string());
        let chain_secret = std::env::var("AWS_RA_CHAIN_SECRET_NAME")
            .unwrap_or_else(|_| DEFAULT_CHAIN_SECRET.to_string());

        let exchange_timeout = Duration::from_secs(
            std::env::var("AWS_RA_EXCHANGE_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_EXCHANGE_TIMEOUT_SECS),
        );
        let fallback_ttl = chrono::Duration::seconds(
            std::env::var("AWS_RA_CREDENTIAL_TTL_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_CREDENTIAL_TTL_SECS),
        );

        Ok(Self {
            region,
            trust_anchor_arn,
            profile_arn,
            role_arn,
            helper_path,
            cert_secret,
            key_secret,
            chain_secret,
            exchange_timeout,
            fallback_ttl,
        })
    }
}

pub struct RolesAnywhereBroker {
    config: RolesAnywhereConfig,
    source: Arc<dyn SourceStore>,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<SessionCredentials>>,
}

impl RolesAnywhereBroker {
    pub fn new(
        config: RolesAnywhereConfig,
        source: Arc<dyn SourceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            source,
            clock,
            cache: Mutex::new(None),
        }
    }

    /// Certificate material from the source vault. A chain that cannot be
    /// fetched is treated as absent.
    async fn fetch_pem_material(&self) -> Result<(String, String, Option<String>)> {
        let cert = self.required_pem(&self.config.cert_secret).await?;
        let key = self.required_pem(&self.config.key_secret).await?;
        let chain = match self.source.get_secret(&self.config.chain_secret, None).await {
            Ok(Some(record)) if !record.value.is_empty() => Some(record.value),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(%err, "certificate chain not available, continuing without");
                None
            }
        };
        Ok((cert, key, chain))
    }

    async fn required_pem(&self, secret_name: &str) -> Result<String> {
        match self.source.get_secret(secret_name, None).await? {
            Some(record) if !record.value.is_empty() => Ok(record.value),
            _ => Err(Error::Config(format!(
                "missing Roles Anywhere material in source vault secret {secret_name}"
            ))),
        }
    }

    async fn exchange(&self) -> Result<SessionCredentials> {
        let staging = tempfile::tempdir()
            .map_err(|err| Error::Credentials(format!("failed to create staging dir: {err}")))?;

        // the helper binary must live somewhere writable and executable
        let helper = staging.path().join("aws_signing_helper");
        tokio::fs::copy(&self.config.helper_path, &helper)
            .await
            .map_err(|err| {
                Error::Credentials(format!(
                    "failed to stage signing helper from {}: {err}",
                    self.config.helper_path.display()
                ))
            })?;
        set_mode(&helper, 0o755).await?;

        let (cert_pem, key_pem, chain_pem) = self.fetch_pem_material().await?;

        let cert_path = staging.path().join("aws-ra-cert.pem");
        let key_path = staging.path().join("aws-ra-key.pem");
        let chain_path = staging.path().join("aws-ra-chain.pem");
        write_owner_only(&cert_path, &cert_pem).await?;
        write_owner_only(&key_path, &key_pem).await?;
        if let Some(chain) = chain_pem.as_deref() {
            write_owner_only(&chain_path, chain).await?;
        }

        let mut command = tokio::process::Command::new(&helper);
        command
            .arg("credential-process")
            .arg("--region")
            .arg(&self.config.region)
            .arg("--trust-anchor-arn")
            .arg(&self.config.trust_anchor_arn)
            .arg("--profile-arn")
            .arg(&self.config.profile_arn)
            .arg("--role-arn")
            .arg(&self.config.role_arn)
            .arg("--certificate")
            .arg(&cert_path)
            .arg("--private-key")
            .arg(&key_path);
        if chain_pem.is_some() {
            command.arg("--intermediates").arg(&chain_path);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!("invoking signing helper for credential exchange");
        let (status, stdout, stderr) =
            tokio::time::timeout(self.config.exchange_timeout, run_helper(&mut command))
                .await
                .map_err(|_| {
                    Error::Credentials(format!(
                        "signing helper timed out after {}s",
                        self.config.exchange_timeout.as_secs()
                    ))
                })??;

        if !stderr.is_empty() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&stderr).trim(),
                "signing helper stderr"
            );
        }
        if !status.success() {
            return Err(Error::Credentials(format!(
                "signing helper exited with {status}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        let now = self.clock.now();
        parse_helper_output(&stdout, now, self.config.fallback_ttl)
    }
}

#[async_trait]
impl CredentialBroker for RolesAnywhereBroker {
    async fn credentials(&self) -> Result<SessionCredentials> {
        // single-flight: the slot lock is held for the whole exchange
        let mut slot = self.cache.lock().await;
        let now = self.clock.now();
        if let Some(cached) = slot.as_ref() {
            if cached.fresh_at(now, chrono::Duration::seconds(SAFETY_MARGIN_SECS)) {
                tracing::debug!("reusing cached session credentials");
                return Ok(cached.clone());
            }
        }

        let issued = self.exchange().await?;
        tracing::info!(expires_at = %issued.expires_at, "session credentials refreshed");
        *slot = Some(issued.clone());
        Ok(issued)
    }
}

/// Run the staged helper and collect its output. Stdout is read through a
/// capped reader so a misbehaving helper cannot balloon memory; on overflow
/// the child is abandoned and `kill_on_drop` reaps it.
async fn run_helper(
    command: &mut tokio::process::Command,
) -> Result<(std::process::ExitStatus, Vec<u8>, Vec<u8>)> {
    let mut child = command
        .spawn()
        .map_err(|err| Error::Credentials(format!("failed to run signing helper: {err}")))?;
    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| Error::Credentials("signing helper stdout was not captured".into()))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| Error::Credentials("signing helper stderr was not captured".into()))?;

    // drain stderr on its own task so a chatty helper cannot stall stdout
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let mut stdout = Vec::new();
    (&mut stdout_pipe)
        .take(MAX_HELPER_OUTPUT as u64 + 1)
        .read_to_end(&mut stdout)
        .await
        .map_err(|err| Error::Credentials(format!("failed to read signing helper: {err}")))?;
    if stdout.len() > MAX_HELPER_OUTPUT {
        return Err(Error::Credentials(format!(
            "signing helper output exceeded {MAX_HELPER_OUTPUT} bytes"
        )));
    }

    let status = child
        .wait()
        .await
        .map_err(|err| Error::Credentials(format!("failed to run signing helper: {err}")))?;
    let stderr = stderr_task.await.unwrap_or_default();
    Ok((status, stdout, stderr))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperOutput {
    #[serde(default)]
    access_key_id: Option<String>,
    #[serde(default)]
    secret_access_key: Option<String>,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

fn parse_helper_output(
    stdout: &[u8],
    now: DateTime<Utc>,
    fallback_ttl: chrono::Duration,
) -> Result<SessionCredentials> {
    let parsed: HelperOutput = serde_json::from_slice(stdout)
        .map_err(|err| Error::Config(format!("malformed signing helper output: {err}")))?;

    let (Some(access_key_id), Some(secret_access_key), Some(session_token)) = (
        parsed.access_key_id,
        parsed.secret_access_key,
        parsed.session_token,
    ) else {
        return Err(Error::Config(
            "signing helper output is missing AccessKeyId, SecretAccessKey, or SessionToken"
                .into(),
        ));
    };

    // an absent or unparsable expiration falls back to the configured window
    let expires_at = parsed
        .expiration
        .as_deref()
        .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
        .map(|stamp| stamp.with_timezone(&Utc))
        .unwrap_or(now + fallback_ttl);

    Ok(SessionCredentials {
        access_key_id,
        secret_access_key,
        session_token,
        expires_at,
    })
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|err| {
            Error::Credentials(format!("failed to chmod {}: {err}", path.display()))
        })
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Materialize PEM content with owner-only permissions.
async fn write_owner_only(path: &Path, content: &str) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).await.map_err(|err| {
        Error::Credentials(format!("failed to create {}: {err}", path.display()))
    })?;
    file.write_all(content.as_bytes()).await.map_err(|err| {
        Error::Credentials(format!("failed to write {}: {err}", path.display()))
    })?;
    file.flush()
        .await
        .map_err(|err| Error::Credentials(format!("failed to flush {}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn helper_output_parses_with_expiration() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let creds = parse_helper_output(
            br#"{"AccessKeyId":"AKID","SecretAccessKey":"sk","SessionToken":"tok","Expiration":"2026-01-01T13:00:00Z"}"#,
            now,
            chrono::Duration::minutes(30),
        )
        .expect("parses");

        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(
            creds.expires_at,
            Utc.with_ymd_and_hms(2026, 1, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn omitted_expiration_uses_the_fallback_window() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let creds = parse_helper_output(
            br#"{"AccessKeyId":"AKID","SecretAccessKey":"sk","SessionToken":"tok"}"#,
            now,
            chrono::Duration::minutes(30),
        )
        .expect("parses");

        assert_eq!(creds.expires_at, now + chrono::Duration::minutes(30));
    }

    #[test]
    fn unparsable_expiration_uses_the_fallback_window() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let creds = parse_helper_output(
            br#"{"AccessKeyId":"AKID","SecretAccessKey":"sk","SessionToken":"tok","Expiration":"soon"}"#,
            now,
            chrono::Duration::minutes(5),
        )
        .expect("parses");

        assert_eq!(creds.expires_at, now + chrono::Duration::minutes(5));
    }

    #[test]
    fn missing_key_material_is_a_config_error() {
        let err = parse_helper_output(
            br#"{"AccessKeyId":"AKID"}"#,
            Utc::now(),
            chrono::Duration::minutes(30),
        )
        .expect_err("incomplete output");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn non_json_output_is_a_config_error() {
        let err = parse_helper_output(b"segfault", Utc::now(), chrono::Duration::minutes(30))
            .expect_err("not json");
        assert!(matches!(err, Error::Config(_)));
    }
}
