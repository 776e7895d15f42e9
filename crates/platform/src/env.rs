//! Authentication environment for the remote platform.
//!
//! Credentials come from the process environment, the way worker jobs
//! receive them. Nothing here is persisted.

use dxfuse_common::{Error, Result};

const API_SERVER_VAR: &str = "DX_APISERVER_URL";
const TOKEN_VAR: &str = "DX_API_TOKEN";
const JOB_ID_VAR: &str = "DX_JOB_ID";

const DEFAULT_API_SERVER: &str = "https://api.dnanexus.com";

/// Connection parameters for the platform API.
#[derive(Debug, Clone)]
pub struct PlatformEnvironment {
    /// Base URL of the API server, no trailing slash.
    pub api_server: String,
    /// Bearer token presented on every call.
    pub token: String,
    /// Set when running inside a platform worker job.
    pub job_id: Option<String>,
}

impl PlatformEnvironment {
    /// Read the environment. Fails if no token is present; there is no
    /// unauthenticated mode.
    pub fn from_env() -> Result<PlatformEnvironment> {
        let token: String = std::env::var(TOKEN_VAR)
            .map_err(|_| Error::Auth(format!("{} is not set", TOKEN_VAR)))?;
        let api_server: String = std::env::var(API_SERVER_VAR)
            .unwrap_or_else(|_| DEFAULT_API_SERVER.to_string());
        let job_id: Option<String> = std::env::var(JOB_ID_VAR).ok();

        Ok(PlatformEnvironment {
            api_server: api_server.trim_end_matches('/').to_string(),
            token,
            job_id,
        })
    }

    /// Whether the process is running inside a platform worker. Mounts
    /// outside a worker work, but latency to the backing store makes
    /// them second-class.
    pub fn on_worker(&self) -> bool {
        self.job_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let env = PlatformEnvironment {
            api_server: "https://api.example.com/".trim_end_matches('/').to_string(),
            token: "t".to_string(),
            job_id: None,
        };
        assert_eq!(env.api_server, "https://api.example.com");
        assert!(!env.on_worker());
    }
}
