use chrono::{DateTime, Duration, Utc};

/// A secret value read from the source store.
///
/// The version is the source store's identifier; the target store assigns its
/// own versions when the value is written, so the record crosses the trust
/// boundary without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub name: String,
    pub value: String,
    pub version: String,
}

/// Short-lived cross-domain credentials issued by the trust exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionCredentials {
    /// Whether the credentials are still usable at `now`.
    ///
    /// The margin keeps a request that starts just before expiry from racing
    /// it mid-flight.
    pub fn fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now < self.expires_at - margin
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Injectable time source so credential expiry is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock [`Clock`] used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_respects_safety_margin() {
        let now = Utc::now();
        let creds = SessionCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expires_at: now + Duration::seconds(90),
        };

        assert!(creds.fresh_at(now, Duration::seconds(60)));
        assert!(!creds.fresh_at(now + Duration::seconds(31), Duration::seconds(60)));
        assert!(!creds.fresh_at(now + Duration::seconds(120), Duration::seconds(60)));
    }

    #[test]
    fn debug_output_redacts_key_material() {
        let creds = SessionCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "hunter2".into(),
            session_token: "token-value".into(),
            expires_at: Utc::now(),
        };

        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("token-value"));
    }
}
