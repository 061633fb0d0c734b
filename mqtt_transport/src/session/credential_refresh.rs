//! Periodic renewal of enhanced authentication (AUTH packet) credentials.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};

use crate::control_packet::AuthProperties;
use crate::interface::MqttClient;

/// Supplies the bytes used for MQTT enhanced authentication, and knows when they expire.
///
/// Implementations are free to source credentials however they like (file mount, secret
/// store, in-memory token); the refresh loop only needs the raw bytes and an expiry.
pub trait CredentialRefreshProvider: Send + Sync {
    /// Read the current credential.
    ///
    /// # Errors
    /// Returns an error if the credential cannot currently be read.
    fn read_credential(&self) -> std::io::Result<Vec<u8>>;

    /// Determine when a credential will need to be renewed, if that can be determined.
    fn expiry(&self, credential: &[u8]) -> Option<SystemTime>;
}

/// Reads a JWT from a file path and uses its `exp` claim as the renewal deadline.
pub struct FileJwtCredentialProvider {
    path: String,
}

impl FileJwtCredentialProvider {
    /// Create a provider that reads the credential from `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialRefreshProvider for FileJwtCredentialProvider {
    fn read_credential(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    fn expiry(&self, credential: &[u8]) -> Option<SystemTime> {
        let token = std::str::from_utf8(credential).ok()?;
        let exp = jwt_expiry(token).ok()?;
        Some(UNIX_EPOCH + Duration::from_secs(exp))
    }
}

fn jwt_expiry(token: &str) -> Result<u64, String> {
    let parts: Vec<_> = token.split('.').collect();
    if parts.len() != 3 {
        return Err("invalid JWT token".to_string());
    }
    let payload = STANDARD_NO_PAD
        .decode(parts[1])
        .map_err(|e| format!("unable to decode JWT token: {e}"))?;
    let payload = std::str::from_utf8(&payload).map_err(|e| format!("unable to parse JWT token: {e}"))?;
    let payload_json: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| format!("unable to parse JWT token: {e}"))?;
    payload_json
        .get("exp")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| "JWT token does not contain expiry time".to_string())
}

/// Run the credential refresh loop forever: periodically re-authenticate with the broker
/// before the current credential expires.
///
/// The first pass only determines the expiry of the already-connected credential; the first
/// reauthentication only happens once that credential needs to be renewed.
pub async fn run_refresh_loop(
    provider: &dyn CredentialRefreshProvider,
    authentication_method: &str,
    client: &impl MqttClient,
) -> ! {
    let mut first_pass = true;
    let mut sleep_time = Duration::from_secs(5);
    loop {
        if !first_pass {
            tokio::time::sleep(sleep_time).await;
        }
        sleep_time = Duration::from_secs(5);

        let credential = match provider.read_credential() {
            Ok(c) => c,
            Err(e) => {
                log::error!("error reading credential: {e}");
                continue;
            }
        };

        let Some(expiry) = provider.expiry(&credential) else {
            log::error!("unable to determine credential expiry");
            continue;
        };

        if !first_pass {
            let props = AuthProperties {
                method: Some(authentication_method.to_string()),
                data: Some(credential.into()),
                reason: None,
                user_properties: Vec::new(),
            };
            match client.reauth(props).await {
                Ok(()) => log::debug!("credential renewed"),
                Err(e) => {
                    log::error!("error renewing credential: {e}");
                    continue;
                }
            }
        }

        let Ok(time_until_expiry) = expiry.duration_since(SystemTime::now()) else {
            log::error!("error calculating credential expiry time");
            continue;
        };
        let time_until_expiry = time_until_expiry.as_secs();
        if time_until_expiry > 5 {
            sleep_time = Duration::from_secs(time_until_expiry);
        }
        first_pass = false;
    }
}
