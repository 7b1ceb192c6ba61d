//! Post-run notifications.

pub mod message;

use crate::config::NotificationConfig;
use crate::restore::RestoreResult;
use crate::utils::{RestoreError, Result};
use reqwest::StatusCode;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::info;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers a finished [`RestoreResult`] somewhere a human will see it.
pub trait Notifier: Send + Sync {
    fn send(&self, result: &RestoreResult) -> impl Future<Output = Result<()>> + Send;
}

/// WeChat Work group robot webhook
pub struct WechatNotifier {
    client: reqwest::Client,
    webhook_url: String,
    environment: String,
    host: String,
}

impl WechatNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            client,
            webhook_url: config.wechat.webhook_url.clone(),
            environment: config.environment.clone(),
            host,
        })
    }

    /// Build the notifier the configuration asks for, if any.
    pub fn from_config(config: &NotificationConfig) -> Result<Option<Self>> {
        if !config.enabled || !config.wechat.enabled {
            return Ok(None);
        }
        Self::new(config).map(Some)
    }
}

impl Notifier for WechatNotifier {
    async fn send(&self, result: &RestoreResult) -> Result<()> {
        let content = message::build_message(result, &self.environment, &self.host);
        let payload = json!({
            "msgtype": "markdown",
            "markdown": { "content": content },
        });

        info!(length = content.len(), "Sending WeChat notification");
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RestoreError::http("POST webhook", WEBHOOK_TIMEOUT, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(RestoreError::Connection(format!(
                "webhook returned status {}",
                status
            )));
        }
        info!("WeChat notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WechatConfig;
    use crate::restore::RestoreJob;
    use mockito::Matcher;

    fn enabled_config(url: String) -> NotificationConfig {
        NotificationConfig {
            enabled: true,
            environment: "staging".to_string(),
            wechat: WechatConfig {
                webhook_url: url,
                enabled: true,
            },
        }
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let mut config = enabled_config("http://localhost/hook".to_string());
        config.wechat.enabled = false;
        assert!(WechatNotifier::from_config(&config).unwrap().is_none());

        let mut config = enabled_config("http://localhost/hook".to_string());
        config.enabled = false;
        assert!(WechatNotifier::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_posts_markdown_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/cgi-bin/webhook/send")
            .match_query(Matcher::UrlEncoded("key".into(), "abc".into()))
            .match_header("content-type", "application/json")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({ "msgtype": "markdown" })),
                Matcher::Regex("iotdb-datanode-0".to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let url = format!("{}/cgi-bin/webhook/send?key=abc", server.url());
        let notifier = WechatNotifier::from_config(&enabled_config(url)).unwrap().unwrap();
        let result = RestoreResult::new("iotdb-datanode-0", &RestoreJob::default());

        notifier.send(&result).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/hook").with_status(502).create_async().await;

        let notifier = WechatNotifier::new(&enabled_config(format!("{}/hook", server.url()))).unwrap();
        let result = RestoreResult::new("iotdb-datanode-0", &RestoreJob::default());

        let err = notifier.send(&result).await.unwrap_err();
        assert!(matches!(err, RestoreError::Connection(ref msg) if msg.contains("502")));
    }
}
