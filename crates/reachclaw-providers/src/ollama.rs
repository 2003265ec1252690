//! Ollama-backed generation collaborator.
//!
//! Renders a named system/user prompt pair, posts it to `/api/generate`
//! with streaming disabled, and retries a bounded number of times.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reachclaw_core::config::{GenerationConfig, PromptTemplate};
use reachclaw_core::error::{OutreachError, Result};
use reachclaw_core::traits::Generation;
use serde_json::{Value, json};

pub struct OllamaGenerator {
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry_attempts: u32,
    retry_delay: Duration,
    prompts: HashMap<String, PromptTemplate>,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| OutreachError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            prompts: config.prompts.clone(),
            client,
        })
    }

    /// Whether the server is up and has the configured model pulled.
    pub async fn check_health(&self) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|m| model_matches(m, &self.model)),
            Err(e) => {
                tracing::debug!("Ollama health check failed: {e}");
                false
            }
        }
    }

    /// Names of the models available on the server.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OutreachError::TransientCollaborator(format!("ollama ({url}): {e}")))?;
        if !resp.status().is_success() {
            return Err(OutreachError::TransientCollaborator(format!(
                "ollama tags returned {}",
                resp.status()
            )));
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|e| OutreachError::Serialization(e.to_string()))?;
        Ok(json["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn build_body(&self, prompt: &PromptTemplate, variables: &HashMap<String, String>) -> Value {
        let mut body = json!({
            "model": self.model,
            "prompt": render(&prompt.user, variables),
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        if !prompt.system.is_empty() {
            body["system"] = Value::String(render(&prompt.system, variables));
        }
        body
    }

    async fn generate_once(&self, body: &Value) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| OutreachError::TransientCollaborator(format!("ollama ({url}): {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OutreachError::TransientCollaborator(format!(
                "ollama error {status}: {text}"
            )));
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|e| OutreachError::Serialization(e.to_string()))?;
        let text = json["response"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            return Err(OutreachError::TransientCollaborator(
                "ollama returned an empty response".into(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl Generation for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate_text(
        &self,
        template: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String> {
        let prompt = self
            .prompts
            .get(template)
            .ok_or_else(|| OutreachError::Config(format!("unknown prompt template '{template}'")))?;
        let body = self.build_body(prompt, variables);

        let mut last_error = None;
        for attempt in 1..=self.retry_attempts {
            match self.generate_once(&body).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Generation '{template}' attempt {attempt}/{} failed: {e}",
                        self.retry_attempts
                    );
                    last_error = Some(e);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            OutreachError::TransientCollaborator(format!("generation '{template}' failed"))
        }))
    }
}

/// Substitute `{name}` placeholders. Unknown placeholders are left as-is.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// `llama3.2` matches `llama3.2:latest`.
fn model_matches(available: &str, wanted: &str) -> bool {
    available == wanted || available.split(':').next() == Some(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::{get, post}};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(base_url: String) -> GenerationConfig {
        GenerationConfig {
            base_url,
            retry_delay_secs: 0,
            ..Default::default()
        }
    }

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("name".to_string(), "Ada".to_string()),
            ("company".to_string(), "Acme AI".to_string()),
            ("title".to_string(), "CTO".to_string()),
        ])
    }

    #[test]
    fn test_render_placeholders() {
        let out = render("Hi {name} at {company}, {unknown}", &vars());
        assert_eq!(out, "Hi Ada at Acme AI, {unknown}");
    }

    #[test]
    fn test_build_body() {
        let generator = OllamaGenerator::new(&GenerationConfig::default()).unwrap();
        let prompt = &GenerationConfig::default().prompts["connection_request"];
        let body = generator.build_body(prompt, &vars());
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 1000);
        assert!(body["prompt"].as_str().unwrap().contains("Ada, CTO at Acme AI"));
        assert!(body["system"].as_str().is_some());
    }

    #[test]
    fn test_model_matches() {
        assert!(model_matches("llama3.2:latest", "llama3.2"));
        assert!(model_matches("llama3.2", "llama3.2"));
        assert!(!model_matches("llama3.1:8b", "llama3.2"));
    }

    #[tokio::test]
    async fn test_generate_retries_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/generate",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "loading"})))
                    } else {
                        let prompt = body["prompt"].as_str().unwrap_or("").to_string();
                        (axum::http::StatusCode::OK, Json(json!({"response": format!("  echo: {prompt} ")})))
                    }
                }
            }),
        );
        let generator = OllamaGenerator::new(&config(serve(app).await)).unwrap();
        let text = generator.generate_text("connection_request", &vars()).await.unwrap();
        assert!(text.starts_with("echo: Write a connection note"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generate_gives_up_after_attempts() {
        let app = Router::new().route("/api/generate", post(|| async { Json(json!({"response": ""})) }));
        let generator = OllamaGenerator::new(&config(serve(app).await)).unwrap();
        let err = generator.generate_text("viral_post", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, OutreachError::TransientCollaborator(_)));
    }

    #[tokio::test]
    async fn test_unknown_template_is_config_error() {
        let generator = OllamaGenerator::new(&GenerationConfig::default()).unwrap();
        let err = generator.generate_text("nope", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, OutreachError::Config(_)));
    }

    #[tokio::test]
    async fn test_health_and_models() {
        let app = Router::new().route(
            "/api/tags",
            get(|| async { Json(json!({"models": [{"name": "llama3.2:latest"}, {"name": "mistral:7b"}]})) }),
        );
        let generator = OllamaGenerator::new(&config(serve(app).await)).unwrap();
        assert_eq!(generator.list_models().await.unwrap(), vec!["llama3.2:latest", "mistral:7b"]);
        assert!(generator.check_health().await);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let generator = OllamaGenerator::new(&config("http://127.0.0.1:9".into())).unwrap();
        assert!(!generator.check_health().await);
        let err = generator.generate_text("viral_post", &HashMap::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
