//! Cluster balancer lookup.
//!
//! The balancer is a plain HTTP indirection: a GET returns one JavaScript
//! assignment line naming the service node the tenant should dial.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::errors::OrtcError;

static SERVER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^var SOCKET_SERVER = "(http.*)";$"#).expect("valid server pattern"));

/// Extracts the service URL from a balancer response body.
pub(crate) fn parse_server_line(body: &str) -> Option<String> {
    SERVER_LINE.captures(body.trim()).map(|caps| caps[1].trim().to_string())
}

/// Asks the balancer at `balancer_url` for the service node assigned to
/// `application_key`. Any response that does not carry a service URL is a
/// hard failure.
pub async fn resolve(balancer_url: &str, application_key: &str) -> Result<String, OrtcError> {
    let mut request_url = balancer_url.to_string();
    if !application_key.is_empty() {
        request_url.push_str("?appkey=");
        request_url.push_str(application_key);
    }
    debug!(url = %request_url, "resolving service node from balancer");

    let body = reqwest::get(&request_url).await?.text().await?;
    parse_server_line(&body).ok_or(OrtcError::InvalidBalancerResponse)
}
