//! Oracle abstraction for chat-completion calls.
//!
//! The [`Oracle`] trait decouples the agents from the HTTP transport. Tests
//! use scripted oracles that answer per [`Purpose`] without network access.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{ChatMessage, Purpose, Role};
use crate::io::config::OracleConfig;

/// One chat-completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub purpose: Purpose,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("oracle returned an empty response for {purpose}")]
    EmptyResponse { purpose: Purpose },
    #[error("oracle request failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Abstraction over reasoning backends.
pub trait Oracle {
    /// Send the request and return the raw response text.
    fn chat_completion(&self, request: &OracleRequest, cancel: &CancelToken) -> Result<String>;
}

/// Fail when a response carries no text once trimmed.
pub fn require_text(response: String, purpose: Purpose) -> Result<String> {
    if response.trim().is_empty() {
        return Err(OracleError::EmptyResponse { purpose }.into());
    }
    Ok(response)
}

/// OpenAI-compatible `POST {base_url}/chat/completions` client.
pub struct HttpOracle {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpOracle {
    pub fn from_config(cfg: &OracleConfig) -> Result<Self> {
        let api_key = match cfg.api_key_env.trim() {
            "" => None,
            var => match env::var(var) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => {
                    warn!(env = var, "api key variable is not set, sending unauthenticated requests");
                    None
                }
            },
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key,
        })
    }

    fn body(&self, request: &OracleRequest) -> Result<Vec<u8>> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(WireMessage {
            role: Role::System,
            content: &request.system,
        });
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: m.role,
            content: &m.content,
        }));
        serde_json::to_vec(&CompletionBody {
            model: &self.model,
            messages,
        })
        .context("serialize completion request")
    }
}

impl Oracle for HttpOracle {
    #[instrument(skip_all, fields(purpose = %request.purpose, turns = request.messages.len()))]
    fn chat_completion(&self, request: &OracleRequest, cancel: &CancelToken) -> Result<String> {
        let body = self.body(request)?;
        let mut call = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        debug!(endpoint = %self.endpoint, model = %self.model, "sending chat completion");
        let response = cancel
            .run_blocking(move || -> Result<(u16, String)> {
                let response = call.send().context("send chat completion request")?;
                let status = response.status().as_u16();
                let text = response.text().context("read chat completion response")?;
                Ok((status, text))
            })??;

        let (status, text) = response;
        if !(200..300).contains(&status) {
            return Err(OracleError::Status { status, body: text }.into());
        }
        let parsed: CompletionResponse =
            serde_json::from_str(&text).context("parse chat completion response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("chat completion response has no choices"))?
            .message
            .content
            .unwrap_or_default();
        info!(chars = content.chars().count(), "oracle responded");
        require_text(content, request.purpose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle(base_url: &str) -> HttpOracle {
        HttpOracle::from_config(&OracleConfig {
            base_url: base_url.to_string(),
            api_key_env: String::new(),
            ..OracleConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            oracle("http://localhost:1234/v1/").endpoint,
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    fn body_puts_system_first() {
        let request = OracleRequest {
            system: "be brief".to_string(),
            messages: vec![ChatMessage::user("hi")],
            purpose: Purpose::WhatToDo,
        };
        let body = oracle("http://localhost/v1").body(&request).expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "be brief");
        assert_eq!(json["messages"][1]["role"], "user");
    }

    #[test]
    fn blank_text_is_an_empty_response() {
        let err = require_text(" \n".to_string(), Purpose::EvaluateCode).unwrap_err();
        assert_eq!(
            err.downcast_ref::<OracleError>(),
            Some(&OracleError::EmptyResponse {
                purpose: Purpose::EvaluateCode
            })
        );
        assert_eq!(require_text("ok".into(), Purpose::WhatToDo).expect("text"), "ok");
    }
}
