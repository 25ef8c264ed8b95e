use crate::core::annotate::AnnotateError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_VISION_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_VISION_MODEL: &str = "gpt-4o";
const MAX_TOKENS: u32 = 500;

/// External vision model that describes the image found at a public URL.
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Send `prompt` together with the image and return the model's raw text reply.
    async fn describe(&self, image_url: &str, prompt: &str) -> Result<String, AnnotateError>;
}

/// Client for OpenAI-compatible Chat Completions endpoints.
pub struct OpenAiVisionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiVisionClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, AnnotateError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
        })
    }

    fn request_body(&self, image_url: &str, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": prompt },
                        { "type": "image_url", "image_url": { "url": image_url } }
                    ]
                }
            ],
            "max_tokens": MAX_TOKENS
        })
    }

    fn map_transport_error(&self, error: reqwest::Error) -> AnnotateError {
        if error.is_timeout() {
            AnnotateError::Timeout {
                seconds: self.timeout.as_secs(),
            }
        } else {
            AnnotateError::Http(error)
        }
    }
}

#[async_trait]
impl VisionClient for OpenAiVisionClient {
    async fn describe(&self, image_url: &str, prompt: &str) -> Result<String, AnnotateError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(image_url, prompt))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(AnnotateError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        reply_content(&body)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull `choices[0].message.content` out of a Chat Completions body.
fn reply_content(body: &str) -> Result<String, AnnotateError> {
    let completion: ChatCompletion =
        serde_json::from_str(body).map_err(|e| AnnotateError::Parse {
            message: format!("invalid completion body: {}", e),
        })?;

    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| AnnotateError::Parse {
            message: "completion has no message content".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::annotate::ANNOTATION_PROMPT;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn client() -> OpenAiVisionClient {
        OpenAiVisionClient::new(
            "sk-test",
            "https://vision.test/v1/",
            DEFAULT_VISION_MODEL,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        assert_eq!(client().endpoint, "https://vision.test/v1/chat/completions");
    }

    #[test]
    fn test_request_body_shape() {
        let body = client().request_body("http://cdn.test/a.jpg", ANNOTATION_PROMPT);

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], ANNOTATION_PROMPT);
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "http://cdn.test/a.jpg"
        );
    }

    #[test]
    fn test_reply_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"description\":\"x\"}"}}]}"#;
        assert_eq!(reply_content(body).unwrap(), r#"{"description":"x"}"#);
    }

    #[test]
    fn test_reply_without_choices_is_parse_error() {
        assert!(matches!(
            reply_content(r#"{"choices":[]}"#),
            Err(AnnotateError::Parse { .. })
        ));
        assert!(matches!(
            reply_content("<html>gateway</html>"),
            Err(AnnotateError::Parse { .. })
        ));
    }

    /// Client aimed at a local server, bypassing any proxy from the environment.
    fn local_client(base_url: &str, timeout: Duration) -> OpenAiVisionClient {
        OpenAiVisionClient {
            http: reqwest::Client::builder()
                .no_proxy()
                .timeout(timeout)
                .build()
                .unwrap(),
            endpoint: format!("{}/chat/completions", base_url),
            api_key: "sk-test".to_string(),
            model: DEFAULT_VISION_MODEL.to_string(),
            timeout,
        }
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Answer a single request with a canned response and hand back the raw request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });

        (format!("http://{}/v1", addr), handle)
    }

    #[tokio::test]
    async fn test_describe_returns_message_content() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"description\":\"A cat\"}"}}]}"#,
        )
        .await;
        let client = local_client(&base_url, Duration::from_secs(5));

        let reply = client
            .describe("http://cdn.test/cat.jpg", ANNOTATION_PROMPT)
            .await
            .unwrap();
        assert_eq!(reply, r#"{"description":"A cat"}"#);

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /v1/chat/completions"));
        assert!(request.contains("authorization: bearer sk-test"));
        assert!(request.contains("http://cdn.test/cat.jpg"));
    }

    #[tokio::test]
    async fn test_describe_maps_error_status_to_upstream() {
        let (base_url, server) = serve_once("429 Too Many Requests", r#"{"error":"quota"}"#).await;
        let client = local_client(&base_url, Duration::from_secs(5));

        let error = client
            .describe("http://cdn.test/cat.jpg", ANNOTATION_PROMPT)
            .await
            .unwrap_err();
        match error {
            AnnotateError::Upstream { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, r#"{"error":"quota"}"#);
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_describe_without_choices_is_parse_error() {
        let (base_url, server) = serve_once("200 OK", r#"{"id":"cmpl-1","choices":[]}"#).await;
        let client = local_client(&base_url, Duration::from_secs(5));

        let result = client
            .describe("http://cdn.test/cat.jpg", ANNOTATION_PROMPT)
            .await;
        assert!(matches!(result, Err(AnnotateError::Parse { .. })));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_describe_stalled_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = local_client(&format!("http://{}/v1", addr), Duration::from_millis(200));
        let result = client
            .describe("http://cdn.test/cat.jpg", ANNOTATION_PROMPT)
            .await;
        assert!(matches!(result, Err(AnnotateError::Timeout { .. })));
        server.abort();
    }
}
