//! Persisting a token's channel permissions on the service.

use std::collections::HashMap;
use std::fmt;

use reqwest::{header::CONTENT_TYPE, StatusCode};
use tracing::debug;

use super::balancer;
use crate::errors::OrtcError;

/// One grantable right on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPermission {
    Read,
    Write,
    Presence,
}

impl ChannelPermission {
    fn letter(self) -> &'static str {
        match self {
            ChannelPermission::Read => "r",
            ChannelPermission::Write => "w",
            ChannelPermission::Presence => "p",
        }
    }
}

impl fmt::Display for ChannelPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

/// Saves `permissions` for `authentication_token` on the service, so that a
/// later connect with that token is granted them. Success is exactly HTTP
/// 201.
#[allow(clippy::too_many_arguments)]
pub async fn save_authentication(
    url: &str,
    is_cluster: bool,
    authentication_token: &str,
    authentication_token_is_private: bool,
    application_key: &str,
    time_to_live: u64,
    private_key: &str,
    permissions: &HashMap<String, Vec<ChannelPermission>>,
) -> Result<(), OrtcError> {
    let service_url = if is_cluster {
        balancer::resolve(url, application_key).await?
    } else {
        url.to_string()
    };
    let endpoint = format!("{service_url}/authenticate");
    let body = authentication_body(
        authentication_token,
        authentication_token_is_private,
        application_key,
        time_to_live,
        private_key,
        permissions,
    );
    debug!(url = %endpoint, channels = permissions.len(), "saving authentication");

    let response = reqwest::Client::new()
        .post(&endpoint)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?;
    if response.status() == StatusCode::CREATED {
        Ok(())
    } else {
        Err(OrtcError::AuthenticationNotAuthorized(format!(
            "Authentication request returned {}",
            response.status(),
        )))
    }
}

// The service expects channel names verbatim, so the body is assembled by
// hand rather than form-encoded.
fn authentication_body(
    authentication_token: &str,
    authentication_token_is_private: bool,
    application_key: &str,
    time_to_live: u64,
    private_key: &str,
    permissions: &HashMap<String, Vec<ChannelPermission>>,
) -> String {
    let private = if authentication_token_is_private { "1" } else { "0" };
    let mut body = format!(
        "AT={authentication_token}&AK={application_key}&PK={private_key}\
         &TTL={time_to_live}&TP={}&PVT={private}",
        permissions.len(),
    );
    for (channel, grants) in permissions {
        let letters: String = grants.iter().map(|grant| grant.letter()).collect();
        body.push('&');
        body.push_str(channel);
        body.push('=');
        body.push_str(&letters);
    }
    body
}
