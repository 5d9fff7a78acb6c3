//! OpenAI-compatible chat-completions oracle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::OracleConfig;
use crate::providers::{Oracle, OracleError, OracleReply, OracleRequest};

pub struct ChatOracle {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl ChatOracle {
    pub fn new(config: &OracleConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}{}", config.api_base.trim_end_matches('/'), config.path),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn body(&self, request: &OracleRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_instruction {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "temperature": self.temperature,
            "messages": messages,
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl Oracle for ChatOracle {
    async fn ask(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        if self.api_key.trim().is_empty() {
            return Err(OracleError::NotInitialized(
                "no API key configured (set QUARRY_ORACLE_API_KEY)".into(),
            ));
        }

        let res = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.body(&request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Request(format!("request timed out: {e}"))
                } else {
                    OracleError::Request(e.to_string())
                }
            })?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;

        classify_status(status, &text)?;

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| OracleError::InvalidResponse(format!("body is not JSON: {e}")))?;
        let content = parse_chat_content(&json)?;
        tracing::debug!(chars = content.len(), "oracle replied");
        Ok(OracleReply { content })
    }
}

/// Map an HTTP status and body onto the oracle error classes.
fn classify_status(status: StatusCode, body: &str) -> Result<(), OracleError> {
    if status.is_success() {
        return Ok(());
    }
    let snippet = crate::rag::text::truncate_preview(body.trim(), 200);
    let quota_body = body.contains("insufficient_quota") || body.contains("quota");

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(OracleError::NotInitialized(format!("{status}: {snippet}")))
        }
        StatusCode::TOO_MANY_REQUESTS => Err(OracleError::QuotaExceeded(format!("{status}: {snippet}"))),
        _ if quota_body => Err(OracleError::QuotaExceeded(format!("{status}: {snippet}"))),
        _ => Err(OracleError::Request(format!("{status}: {snippet}"))),
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_content(json: &Value) -> Result<String, OracleError> {
    json.get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| OracleError::InvalidResponse("missing choices[0].message.content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle(api_key: &str) -> ChatOracle {
        ChatOracle::new(&OracleConfig {
            api_key: api_key.into(),
            ..OracleConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn parses_choice_content() {
        let json = serde_json::json!({
            "choices": [ { "message": { "role": "assistant", "content": "{\"decision\":\"ANSWER\"}" } } ]
        });
        assert_eq!(parse_chat_content(&json).unwrap(), "{\"decision\":\"ANSWER\"}");
    }

    #[test]
    fn missing_content_is_invalid() {
        let json = serde_json::json!({ "choices": [] });
        assert!(matches!(parse_chat_content(&json), Err(OracleError::InvalidResponse(_))));
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK, "").is_ok());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            Err(OracleError::NotInitialized(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            Err(OracleError::QuotaExceeded(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, r#"{"error":{"code":"insufficient_quota"}}"#),
            Err(OracleError::QuotaExceeded(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            Err(OracleError::Request(_))
        ));
    }

    #[test]
    fn request_body_shape() {
        let oracle = oracle("k");
        let body = oracle.body(&OracleRequest {
            prompt: "hi".into(),
            model: Some("other-model".into()),
            system_instruction: Some("be terse".into()),
            json_mode: true,
        });
        assert_eq!(body["model"], "other-model");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[tokio::test]
    async fn missing_key_is_not_initialized() {
        let err = oracle("").ask(OracleRequest::default()).await.unwrap_err();
        assert!(matches!(err, OracleError::NotInitialized(_)));
    }
}
