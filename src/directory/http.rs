//! HTTP directory providers: Mojang and PlayerDB.
//!
//! Both use a blocking `ureq` agent with connect/read/write timeouts so a
//! hung socket cannot outlive the chain's own call timeout by much.

use std::time::Duration;

use serde::Deserialize;

use crate::config::DirectoryConfig;
use crate::error::ProviderError;
use crate::identity::{DisplayName, IdentityKey};

use super::{DirectoryProfile, DirectoryProvider};

#[derive(Debug, Clone)]
struct Http {
    agent: ureq::Agent,
    timeout: Duration,
}

impl Http {
    fn new(config: &DirectoryConfig) -> Self {
        let timeout = config.call_timeout();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(&config.user_agent)
            .build();
        Self { agent, timeout }
    }
}

fn provider_error_from_ureq(provider: &str, timeout: Duration, err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(status, _) => ProviderError::HttpStatus {
            provider: provider.to_string(),
            status,
        },
        ureq::Error::Transport(transport) => {
            let message = transport.to_string();
            if message.to_ascii_lowercase().contains("timed out")
                || message.to_ascii_lowercase().contains("timeout")
            {
                ProviderError::Timeout {
                    provider: provider.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            } else {
                ProviderError::Transport {
                    provider: provider.to_string(),
                    message,
                }
            }
        }
    }
}

fn malformed(provider: &str, message: impl Into<String>) -> ProviderError {
    ProviderError::MalformedResponse {
        provider: provider.to_string(),
        message: message.into(),
    }
}

/// GETs `url`, mapping "no such profile" statuses to `None`.
fn get_json<T: for<'de> Deserialize<'de>>(
    http: &Http,
    provider: &str,
    url: &str,
    not_found: &[u16],
) -> Result<Option<T>, ProviderError> {
    let response = match http.agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(status, _)) if not_found.contains(&status) => return Ok(None),
        Err(e) => return Err(provider_error_from_ureq(provider, http.timeout, e)),
    };
    if not_found.contains(&response.status()) {
        return Ok(None);
    }
    response
        .into_json::<T>()
        .map(Some)
        .map_err(|e| malformed(provider, e.to_string()))
}

#[derive(Debug, Deserialize)]
struct MojangProfile {
    id: String,
    name: String,
}

impl MojangProfile {
    fn into_profile(self, provider: &str) -> Result<DirectoryProfile, ProviderError> {
        let id: IdentityKey = self
            .id
            .parse()
            .map_err(|e| malformed(provider, format!("bad profile id: {e}")))?;
        let name = DisplayName::new(&self.name)
            .map_err(|e| malformed(provider, format!("bad profile name: {e}")))?;
        Ok(DirectoryProfile::new(id, name))
    }
}

fn session_profile(
    http: &Http,
    provider: &str,
    session_base: &str,
    key: IdentityKey,
) -> Result<Option<DirectoryProfile>, ProviderError> {
    let url = format!(
        "{}/session/minecraft/profile/{key}",
        session_base.trim_end_matches('/')
    );
    get_json::<MojangProfile>(http, provider, &url, &[204, 404])?
        .map(|p| p.into_profile(provider))
        .transpose()
}

/// Mojang's profile API and session server.
#[derive(Debug, Clone)]
pub struct MojangProvider {
    http: Http,
    api_base: String,
    session_base: String,
}

impl MojangProvider {
    /// Provider name in logs and errors.
    pub const NAME: &'static str = "mojang";

    /// Creates a provider from directory settings.
    #[must_use]
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            http: Http::new(config),
            api_base: config.mojang_api_base.trim_end_matches('/').to_string(),
            session_base: config.mojang_session_base.clone(),
        }
    }
}

impl DirectoryProvider for MojangProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn lookup(&self, name: &str) -> Result<Option<DirectoryProfile>, ProviderError> {
        let url = format!("{}/users/profiles/minecraft/{name}", self.api_base);
        get_json::<MojangProfile>(&self.http, Self::NAME, &url, &[204, 404])?
            .map(|p| p.into_profile(Self::NAME))
            .transpose()
    }

    fn lookup_by_key(&self, key: IdentityKey) -> Result<Option<DirectoryProfile>, ProviderError> {
        session_profile(&self.http, Self::NAME, &self.session_base, key)
    }
}

#[derive(Debug, Deserialize)]
struct PlayerDbResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<PlayerDbData>,
}

#[derive(Debug, Deserialize)]
struct PlayerDbData {
    player: Option<PlayerDbPlayer>,
}

#[derive(Debug, Deserialize)]
struct PlayerDbPlayer {
    raw_id: String,
    username: String,
}

/// PlayerDB lookup, with the cached name verified against Mojang's session
/// server when possible.
#[derive(Debug, Clone)]
pub struct PlayerDbProvider {
    http: Http,
    base: String,
    session_base: String,
}

impl PlayerDbProvider {
    /// Provider name in logs and errors.
    pub const NAME: &'static str = "playerdb";

    /// Creates a provider from directory settings.
    #[must_use]
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            http: Http::new(config),
            base: config.playerdb_base.trim_end_matches('/').to_string(),
            session_base: config.mojang_session_base.clone(),
        }
    }
}

impl DirectoryProvider for PlayerDbProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn lookup(&self, name: &str) -> Result<Option<DirectoryProfile>, ProviderError> {
        let url = format!("{}/api/player/minecraft/{name}", self.base);
        let Some(body) = get_json::<PlayerDbResponse>(&self.http, Self::NAME, &url, &[400, 404])?
        else {
            return Ok(None);
        };
        let Some(player) = body.data.and_then(|d| d.player).filter(|_| body.success) else {
            return Ok(None);
        };
        let cached = MojangProfile {
            id: player.raw_id,
            name: player.username,
        }
        .into_profile(Self::NAME)?;

        // PlayerDB caches; the session server knows the current name.
        match session_profile(&self.http, Self::NAME, &self.session_base, cached.id) {
            Ok(Some(current)) => {
                if !current.name.eq_folded(cached.name.as_str()) {
                    tracing::debug!(
                        cached = %cached.name,
                        current = %current.name,
                        "playerdb returned a stale name"
                    );
                }
                Ok(Some(current))
            }
            Ok(None) => Ok(Some(cached)),
            Err(e) => {
                tracing::debug!(error = %e, "session server verification failed; using cached name");
                Ok(Some(cached))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mojang_profile_parses_simple_uuid() {
        let raw: MojangProfile =
            serde_json::from_str(r#"{"id":"069a79f444e94726a5befca90e38aaf5","name":"Notch"}"#).unwrap();
        let profile = raw.into_profile("mojang").unwrap();
        assert_eq!(profile.name.as_str(), "Notch");
        assert_eq!(profile.id.to_string(), "069a79f444e94726a5befca90e38aaf5");
    }

    #[test]
    fn mojang_profile_rejects_bad_id() {
        let raw = MojangProfile {
            id: "nope".to_string(),
            name: "Notch".to_string(),
        };
        assert!(matches!(
            raw.into_profile("mojang"),
            Err(ProviderError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn playerdb_payload_shape() {
        let body: PlayerDbResponse = serde_json::from_str(
            r#"{"code":"player.found","success":true,"data":{"player":{"username":"Notch","raw_id":"069a79f444e94726a5befca90e38aaf5","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}}}"#,
        )
        .unwrap();
        assert!(body.success);
        assert_eq!(body.data.unwrap().player.unwrap().username, "Notch");

        let missing: PlayerDbResponse =
            serde_json::from_str(r#"{"code":"minecraft.invalid_username","success":false,"data":{}}"#).unwrap();
        assert!(!missing.success);
    }

    #[test]
    fn providers_build_from_config() {
        let config = DirectoryConfig::default();
        assert_eq!(MojangProvider::new(&config).name(), "mojang");
        assert_eq!(PlayerDbProvider::new(&config).name(), "playerdb");
    }

    #[test]
    fn agent_carries_call_timeout() {
        let config = DirectoryConfig::default();
        let http = Http::new(&config);
        assert_eq!(http.timeout, config.call_timeout());

        let err = provider_error_from_ureq(
            "mojang",
            http.timeout,
            ureq::Error::Status(503, ureq::Response::new(503, "Service Unavailable", "").unwrap()),
        );
        assert!(matches!(err, ProviderError::HttpStatus { status: 503, .. }));
        assert!(err.is_retryable());
    }
}
