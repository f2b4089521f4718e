//! Out-of-band presence queries and toggles.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use super::balancer;
use crate::errors::OrtcError;

/// Subscriber count and (when enabled) the first batch of unique connection
/// metadata for one channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresenceData {
    #[serde(rename = "Subscriptions", default)]
    pub subscriptions: u64,
    #[serde(rename = "Metadata", default)]
    pub metadata: HashMap<String, u64>,
}

/// Fetches the presence data of `channel`.
pub async fn presence(
    url: &str,
    is_cluster: bool,
    application_key: &str,
    authentication_token: &str,
    channel: &str,
) -> Result<PresenceData, OrtcError> {
    let service_url = service_url(url, is_cluster, application_key).await?;
    let endpoint = format!(
        "{}presence/{application_key}/{authentication_token}/{channel}",
        with_trailing_slash(&service_url),
    );
    debug!(url = %endpoint, "fetching presence");
    Ok(reqwest::get(&endpoint).await?.json().await?)
}

/// Enables presence on `channel`; with `metadata` the service also tracks
/// connection metadata. Returns the raw service response.
pub async fn enable_presence(
    url: &str,
    is_cluster: bool,
    application_key: &str,
    private_key: &str,
    channel: &str,
    metadata: bool,
) -> Result<String, OrtcError> {
    let service_url = service_url(url, is_cluster, application_key).await?;
    let endpoint = format!(
        "{}presence/enable/{application_key}/{channel}",
        with_trailing_slash(&service_url),
    );
    let mut form = vec![("privatekey", private_key.to_string())];
    if metadata {
        form.push(("metadata", "1".to_string()));
    }
    debug!(url = %endpoint, "enabling presence");
    let response = reqwest::Client::new().post(&endpoint).form(&form).send().await?;
    Ok(response.text().await?)
}

/// Disables presence on `channel`. Returns the raw service response.
pub async fn disable_presence(
    url: &str,
    is_cluster: bool,
    application_key: &str,
    private_key: &str,
    channel: &str,
) -> Result<String, OrtcError> {
    let service_url = service_url(url, is_cluster, application_key).await?;
    let endpoint = format!(
        "{}presence/disable/{application_key}/{channel}",
        with_trailing_slash(&service_url),
    );
    let form = [("privatekey", private_key.to_string())];
    debug!(url = %endpoint, "disabling presence");
    let response = reqwest::Client::new().post(&endpoint).form(&form).send().await?;
    Ok(response.text().await?)
}

async fn service_url(
    url: &str,
    is_cluster: bool,
    application_key: &str,
) -> Result<String, OrtcError> {
    if is_cluster {
        balancer::resolve(url, application_key).await
    } else {
        Ok(url.to_string())
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_handling() {
        assert_eq!(with_trailing_slash("http://a"), "http://a/");
        assert_eq!(with_trailing_slash("http://a/"), "http://a/");
    }

    #[test]
    fn deserializes_the_presence_shape() {
        let data: PresenceData =
            serde_json::from_str(r#"{"Subscriptions": 2, "Metadata": {"GoApp": 1, "RustApp": 1}}"#)
                .unwrap();
        assert_eq!(data.subscriptions, 2);
        assert_eq!(data.metadata["RustApp"], 1);

        let empty: PresenceData = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.subscriptions, 0);
        assert!(empty.metadata.is_empty());
    }

    #[tokio::test]
    async fn fetches_presence() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/presence/APP/myToken/my_channel")
            .with_body(r#"{"Subscriptions": 3, "Metadata": {"app": 3}}"#)
            .create_async()
            .await;

        let data = presence(&server.url(), false, "APP", "myToken", "my_channel").await.unwrap();
        assert_eq!(data.subscriptions, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn enable_posts_the_private_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/presence/enable/APP/my_channel")
            .match_body(mockito::Matcher::UrlEncoded("privatekey".into(), "PRIV".into()))
            .with_body("OK")
            .create_async()
            .await;

        let response =
            enable_presence(&server.url(), false, "APP", "PRIV", "my_channel", true).await.unwrap();
        assert_eq!(response, "OK");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn disable_posts_the_private_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/presence/disable/APP/my_channel")
            .match_body(mockito::Matcher::UrlEncoded("privatekey".into(), "PRIV".into()))
            .with_body("OK")
            .create_async()
            .await;

        let response =
            disable_presence(&server.url(), false, "APP", "PRIV", "my_channel").await.unwrap();
        assert_eq!(response, "OK");
        mock.assert_async().await;
    }
}
