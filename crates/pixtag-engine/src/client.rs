use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pixtag_contracts::templates::{PromptTemplate, TemplateSelection, TemplateSelector};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Endpoints of the KoboldCpp-compatible generation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFunction {
    Model,
    MaxContextLength,
    TokenCount,
    Version,
    Generate,
}

impl ApiFunction {
    pub fn path(self) -> &'static str {
        match self {
            Self::Model => "/api/v1/model",
            Self::MaxContextLength => "/api/extra/true_max_context_length",
            Self::TokenCount => "/api/extra/tokencount",
            Self::Version => "/api/extra/version",
            Self::Generate => "/api/v1/generate",
        }
    }

    fn is_post(self) -> bool {
        matches!(self, Self::TokenCount | Self::Generate)
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned a malformed envelope: {detail}")]
    Envelope { endpoint: String, detail: String },
}

/// Correlation key the service uses to tell concurrent generation streams
/// apart. One per client; passed explicitly into every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey(String);

impl SessionKey {
    /// `KCP` followed by four random digits.
    pub fn generate() -> Self {
        Self(format!("KCP{}", random_digits(4)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Decimal digits taken from the random bytes of a v4 uuid.
fn random_digits(count: usize) -> String {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(count)
        .map(|byte| char::from(b'0' + byte % 10))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub max_length: u32,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub rep_pen: Option<f64>,
    pub min_p: Option<f64>,
}

pub const CAPTION_SAMPLING: Sampling = Sampling {
    max_length: 150,
    temperature: 0.1,
    top_p: None,
    top_k: None,
    rep_pen: None,
    min_p: None,
};

pub const METADATA_SAMPLING: Sampling = Sampling {
    max_length: 256,
    temperature: 0.5,
    top_p: Some(1.0),
    top_k: Some(0),
    rep_pen: Some(1.0),
    min_p: Some(0.05),
};

/// One generation call. Built fresh per call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub images: Vec<String>,
    pub sampling: Sampling,
    pub model_hint: Option<String>,
}

impl GenerationRequest {
    pub fn caption(prompt: String, image_bytes: &[u8]) -> Self {
        Self {
            prompt,
            images: vec![BASE64.encode(image_bytes)],
            sampling: CAPTION_SAMPLING,
            model_hint: Some("clip".to_string()),
        }
    }

    pub fn text(prompt: String) -> Self {
        Self {
            prompt,
            images: Vec::new(),
            sampling: METADATA_SAMPLING,
            model_hint: None,
        }
    }

    pub fn to_payload(&self, session: &SessionKey) -> Value {
        let mut payload = Map::new();
        payload.insert("prompt".to_string(), json!(self.prompt));
        if !self.images.is_empty() {
            payload.insert("images".to_string(), json!(self.images));
        }
        payload.insert("max_length".to_string(), json!(self.sampling.max_length));
        payload.insert("genkey".to_string(), json!(session.as_str()));
        payload.insert("temperature".to_string(), json!(self.sampling.temperature));
        if let Some(model) = &self.model_hint {
            payload.insert("model".to_string(), json!(model));
        }
        let optional = [
            ("top_p", self.sampling.top_p.map(|value| json!(value))),
            ("top_k", self.sampling.top_k.map(|value| json!(value))),
            ("rep_pen", self.sampling.rep_pen.map(|value| json!(value))),
            ("min_p", self.sampling.min_p.map(|value| json!(value))),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                payload.insert(key.to_string(), value);
            }
        }
        Value::Object(payload)
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub api_password: String,
    pub timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5001".to_string(),
            api_password: String::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// What the pipeline needs from a generation backend.
pub trait Generator {
    fn caption(&self, image_bytes: &[u8], instruction: &str) -> Option<String>;
    fn generate(&self, instruction: &str, content: &str) -> Option<String>;

    /// Context window in tokens, when known.
    fn max_context(&self) -> Option<u64> {
        None
    }
}

/// Blocking client for the generation service.
///
/// Expected network faults are logged and surface as `None`; nothing is
/// retried here.
pub struct GenerationClient {
    http: HttpClient,
    api_base: String,
    credential: String,
    session: SessionKey,
    selection: TemplateSelection,
    max_context: Option<u64>,
}

impl GenerationClient {
    /// Builds the client, asks the service for its model name and context
    /// size, and fixes the prompt template for the client's lifetime. An
    /// unreachable service falls back to the default template.
    pub fn connect(settings: &ClientSettings) -> anyhow::Result<Self> {
        let mut client = Self::with_template(settings, TemplateSelector::default().select(None))?;
        let model = client.get_model();
        client.selection = TemplateSelector::default().select(model.as_deref());
        client.max_context = client.get_max_context();
        match &client.selection.fallback_reason {
            Some(reason) => warn!(reason = %reason, "using fallback prompt template"),
            None => info!(
                model = client.selection.model.as_deref().unwrap_or(""),
                template = client.template().label(),
                "selected prompt template"
            ),
        }
        Ok(client)
    }

    /// Builds the client around an already chosen template without querying
    /// the service.
    pub fn with_template(
        settings: &ClientSettings,
        selection: TemplateSelection,
    ) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(settings.timeout)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            http,
            api_base: settings.api_url.trim().trim_end_matches('/').to_string(),
            credential: settings.api_password.clone(),
            session: SessionKey::generate(),
            selection,
            max_context: None,
        })
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.selection.template
    }

    pub fn selection(&self) -> &TemplateSelection {
        &self.selection
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session
    }

    pub fn compose_prompt(&self, instruction: &str, content: &str) -> String {
        self.template().wrap(instruction, content)
    }

    pub fn get_model(&self) -> Option<String> {
        let envelope = self.call_logged(ApiFunction::Model, None)?;
        envelope
            .get("result")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn get_max_context(&self) -> Option<u64> {
        let envelope = self.call_logged(ApiFunction::MaxContextLength, None)?;
        envelope
            .get("value")
            .or_else(|| envelope.get("result"))
            .and_then(value_to_u64)
    }

    pub fn version(&self) -> Option<String> {
        let envelope = self.call_logged(ApiFunction::Version, None)?;
        let name = envelope.get("result").and_then(Value::as_str).unwrap_or("");
        let version = envelope.get("version").and_then(Value::as_str).unwrap_or("");
        let text = format!("{name} {version}").trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    pub fn count_tokens(&self, text: &str) -> Option<u64> {
        let payload = json!({"prompt": text, "genkey": self.session.as_str()});
        let envelope = self.call_logged(ApiFunction::TokenCount, Some(&payload))?;
        let count = envelope.get("value").and_then(value_to_u64);
        if count.is_none() {
            warn!(endpoint = ApiFunction::TokenCount.path(), "token count missing from response");
        }
        count
    }

    pub fn caption(&self, image_bytes: &[u8], instruction: &str) -> Option<String> {
        let request = GenerationRequest::caption(self.compose_prompt(instruction, ""), image_bytes);
        self.run_generation(&request)
    }

    pub fn generate(&self, instruction: &str, content: &str) -> Option<String> {
        let request = GenerationRequest::text(self.compose_prompt(instruction, content));
        self.run_generation(&request)
    }

    fn run_generation(&self, request: &GenerationRequest) -> Option<String> {
        debug!(
            prompt = %request.prompt,
            images = request.images.len(),
            "querying generation service"
        );
        let payload = request.to_payload(&self.session);
        let envelope = self.call_logged(ApiFunction::Generate, Some(&payload))?;
        let text = envelope
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|first| first.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if text.is_none() {
            warn!(
                endpoint = ApiFunction::Generate.path(),
                "generation response had no results[0].text"
            );
        }
        text
    }

    fn call_logged(&self, function: ApiFunction, payload: Option<&Value>) -> Option<Value> {
        match self.call(function, payload) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(error = %err, "generation service call failed");
                None
            }
        }
    }

    fn call(&self, function: ApiFunction, payload: Option<&Value>) -> Result<Value, GenerationError> {
        let endpoint = format!("{}{}", self.api_base, function.path());
        let request = if function.is_post() {
            self.http.post(&endpoint).json(payload.unwrap_or(&Value::Null))
        } else {
            self.http.get(&endpoint)
        };
        let response = request
            .bearer_auth(&self.credential)
            .send()
            .map_err(|source| GenerationError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;
        response_json_or_error(&endpoint, response)
    }
}

impl Generator for GenerationClient {
    fn caption(&self, image_bytes: &[u8], instruction: &str) -> Option<String> {
        GenerationClient::caption(self, image_bytes, instruction)
    }

    fn generate(&self, instruction: &str, content: &str) -> Option<String> {
        GenerationClient::generate(self, instruction, content)
    }

    fn max_context(&self) -> Option<u64> {
        self.max_context
    }
}

fn response_json_or_error(endpoint: &str, response: HttpResponse) -> Result<Value, GenerationError> {
    let status = response.status();
    let body = response.text().map_err(|source| GenerationError::Transport {
        endpoint: endpoint.to_string(),
        source,
    })?;
    if !status.is_success() {
        return Err(GenerationError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }
    match serde_json::from_str::<Value>(&body) {
        Ok(parsed @ Value::Object(_)) => Ok(parsed),
        Ok(_) => Err(GenerationError::Envelope {
            endpoint: endpoint.to_string(),
            detail: "expected a JSON object".to_string(),
        }),
        Err(err) => Err(GenerationError::Envelope {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        }),
    }
}

fn value_to_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|num| *num >= 0.0).map(|num| num as u64))
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use pixtag_contracts::templates::{PromptTemplate, TemplateSelection};
    use serde_json::{json, Value};

    use super::*;

    fn test_selection() -> TemplateSelection {
        TemplateSelection {
            template: PromptTemplate::new(&["Test"], "<user>", "<assistant>", ""),
            model: None,
            matched_alias: None,
            fallback_reason: None,
        }
    }

    fn settings(api_url: String) -> ClientSettings {
        ClientSettings {
            api_url,
            api_password: "secret".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = stream.read(&mut chunk).unwrap_or(0);
            if read == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..read]);
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serves one canned response per connection, in order.
    fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                requests.push(read_request(&mut stream));
                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
            requests
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn session_key_is_kcp_plus_four_digits() {
        let key = SessionKey::generate();
        assert_eq!(key.as_str().len(), 7);
        assert!(key.as_str().starts_with("KCP"));
        assert!(key.as_str()[3..].chars().all(|ch| ch.is_ascii_digit()));
    }

    #[test]
    fn caption_payload_carries_image_and_low_temperature() {
        let session = SessionKey("KCP0042".to_string());
        let payload =
            GenerationRequest::caption("<u>Describe<a>".to_string(), b"abc").to_payload(&session);
        assert_eq!(payload["prompt"], json!("<u>Describe<a>"));
        assert_eq!(payload["images"], json!(["YWJj"]));
        assert_eq!(payload["max_length"], json!(150));
        assert_eq!(payload["temperature"], json!(0.1));
        assert_eq!(payload["genkey"], json!("KCP0042"));
        assert_eq!(payload["model"], json!("clip"));
        assert!(payload.get("top_k").is_none());
    }

    #[test]
    fn text_payload_uses_metadata_sampling_without_images() {
        let session = SessionKey("KCP0001".to_string());
        let payload = GenerationRequest::text("prompt".to_string()).to_payload(&session);
        assert!(payload.get("images").is_none());
        assert_eq!(payload["max_length"], json!(256));
        assert_eq!(payload["temperature"], json!(0.5));
        assert_eq!(payload["top_p"], json!(1.0));
        assert_eq!(payload["top_k"], json!(0));
        assert_eq!(payload["rep_pen"], json!(1.0));
        assert_eq!(payload["min_p"], json!(0.05));
        assert_eq!(payload["genkey"], json!("KCP0001"));
    }

    #[test]
    fn compose_prompt_wraps_in_template_turns() -> anyhow::Result<()> {
        let client = GenerationClient::with_template(
            &settings("http://127.0.0.1:9".to_string()),
            test_selection(),
        )?;
        assert_eq!(
            client.compose_prompt("Describe. ", "content"),
            "<user>Describe. content<assistant>"
        );
        Ok(())
    }

    #[test]
    fn transport_failure_returns_none() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let client =
            GenerationClient::with_template(&settings(format!("http://{addr}")), test_selection())?;
        assert_eq!(client.get_model(), None);
        assert_eq!(client.count_tokens("hello"), None);
        assert_eq!(Generator::caption(&client, b"img", "What is this?"), None);
        assert_eq!(client.generate("Describe", "x"), None);
        Ok(())
    }

    #[test]
    fn connect_selects_template_from_model_name() -> anyhow::Result<()> {
        let (url, handle) = serve(vec![
            (200, json!({"result": "koboldcpp/Meta-Llama-3-8B-Instruct"}).to_string()),
            (200, json!({"value": 8192}).to_string()),
        ]);
        let client = GenerationClient::connect(&settings(url))?;
        assert_eq!(client.template().label(), "Llama 3");
        assert_eq!(Generator::max_context(&client), Some(8192));

        let requests = handle.join().unwrap_or_default();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("GET /api/v1/model "));
        assert!(requests[1].starts_with("GET /api/extra/true_max_context_length "));
        assert!(requests[0]
            .to_ascii_lowercase()
            .contains("authorization: bearer secret"));
        Ok(())
    }

    #[test]
    fn connect_without_service_uses_default_template() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let client = GenerationClient::connect(&settings(format!("http://{addr}")))?;
        assert_eq!(client.template().label(), "Alpaca");
        assert!(client.selection().fallback_reason.is_some());
        assert_eq!(Generator::max_context(&client), None);
        Ok(())
    }

    #[test]
    fn generate_reads_first_result_text() -> anyhow::Result<()> {
        let (url, handle) = serve(vec![(
            200,
            json!({"results": [{"text": "{\"Title\": \"Fox\"}"}]}).to_string(),
        )]);
        let client = GenerationClient::with_template(&settings(url), test_selection())?;
        assert_eq!(
            client.generate("Make JSON. ", "Caption: a fox."),
            Some("{\"Title\": \"Fox\"}".to_string())
        );

        let requests = handle.join().unwrap_or_default();
        let body_start = requests[0].find("\r\n\r\n").map(|pos| pos + 4).unwrap_or(0);
        let body: Value = serde_json::from_str(&requests[0][body_start..])?;
        assert!(requests[0].starts_with("POST /api/v1/generate "));
        assert_eq!(body["prompt"], json!("<user>Make JSON. Caption: a fox.<assistant>"));
        assert_eq!(body["genkey"], json!(client.session_key().as_str()));
        Ok(())
    }

    #[test]
    fn count_tokens_reads_value() -> anyhow::Result<()> {
        let (url, handle) = serve(vec![(200, json!({"value": 17}).to_string())]);
        let client = GenerationClient::with_template(&settings(url), test_selection())?;
        assert_eq!(client.count_tokens("some text"), Some(17));
        let requests = handle.join().unwrap_or_default();
        assert!(requests[0].starts_with("POST /api/extra/tokencount "));
        Ok(())
    }

    #[test]
    fn error_status_and_bad_envelopes_return_none() -> anyhow::Result<()> {
        let (url, handle) = serve(vec![
            (500, json!({"error": "busy"}).to_string()),
            (200, json!({"unexpected": true}).to_string()),
            (200, "not json".to_string()),
        ]);
        let client = GenerationClient::with_template(&settings(url), test_selection())?;
        assert_eq!(client.generate("a", "b"), None);
        assert_eq!(client.generate("a", "b"), None);
        assert_eq!(client.generate("a", "b"), None);
        assert_eq!(handle.join().unwrap_or_default().len(), 3);
        Ok(())
    }
}
