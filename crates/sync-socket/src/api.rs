//! Request/response side of the session: conversation list, history and sends.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Client, RequestBuilder, Response,
    header::RETRY_AFTER,
    multipart::{Form, Part},
};
use serde::Serialize;
use sync_core::{
    Conversation, HistoryOrder, Message, MessageEvent, OutgoingContent, OutgoingImage,
    SendReceipt, SyncError, SyncErrorCategory, classify_http_status,
};
use sync_platform::{CredentialError, CredentialSource};
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// Collaborator operations the runtime calls over request/response.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Ordered conversation summaries.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, SyncError>;

    /// Up to `limit` messages of a thread in the requested order.
    async fn fetch_history(
        &self,
        thread_id: &str,
        limit: u16,
        order: HistoryOrder,
    ) -> Result<Vec<Message>, SyncError>;

    async fn send_message(
        &self,
        thread_id: &str,
        content: &OutgoingContent,
    ) -> Result<SendReceipt, SyncError>;
}

#[derive(Serialize)]
struct SendTextBody<'a> {
    text: &'a str,
}

/// `reqwest`-backed [`ChatApi`] talking JSON to the chat service.
#[derive(Clone)]
pub struct HttpChatApi {
    http: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialSource>,
}

impl fmt::Debug for HttpChatApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChatApi")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpChatApi {
    pub fn new(base_url: Url, credentials: Arc<dyn CredentialSource>) -> Result<Self, SyncError> {
        if base_url.cannot_be_a_base() {
            return Err(invalid_base_url(&base_url));
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("sync-socket/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                SyncError::new(SyncErrorCategory::Config, "http_client_build_error", err.to_string())
            })?;

        Ok(Self::with_client(http, base_url, credentials))
    }

    /// Use a preconfigured `reqwest` client (proxies, TLS roots, timeouts).
    pub fn with_client(http: Client, base_url: Url, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            http,
            base_url,
            credentials,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        endpoint_url(&self.base_url, segments)
    }

    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, SyncError> {
        match self.credentials.session_token().map_err(map_credential_error)? {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Ok(request),
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, SyncError> {
        let response = self
            .authorize(request)?
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await
    }

    fn image_form(image: &OutgoingImage) -> Result<Form, SyncError> {
        let part = Part::bytes(image.data.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)
            .map_err(|err| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "invalid_content_type",
                    format!("invalid content type '{}': {err}", image.content_type),
                )
            })?;
        Ok(Form::new().part("file", part))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        let url = self.endpoint(&["conversations"])?;
        let response = self.execute(self.http.get(url)).await?;
        response.json().await.map_err(map_reqwest_error)
    }

    async fn fetch_history(
        &self,
        thread_id: &str,
        limit: u16,
        order: HistoryOrder,
    ) -> Result<Vec<Message>, SyncError> {
        let url = history_url(&self.base_url, thread_id, limit, order)?;
        let response = self.execute(self.http.get(url)).await?;
        let events: Vec<MessageEvent> = response.json().await.map_err(map_reqwest_error)?;
        debug!(%thread_id, count = events.len(), "history fetched");
        Ok(events.into_iter().map(MessageEvent::into_message).collect())
    }

    async fn send_message(
        &self,
        thread_id: &str,
        content: &OutgoingContent,
    ) -> Result<SendReceipt, SyncError> {
        let request = match content {
            OutgoingContent::Text(text) => {
                let url = self.endpoint(&["conversations", thread_id, "messages"])?;
                self.http.post(url).json(&SendTextBody { text: text.trim() })
            }
            OutgoingContent::Image(image) => {
                let url = self.endpoint(&["conversations", thread_id, "images"])?;
                self.http.post(url).multipart(Self::image_form(image)?)
            }
        };

        let response = self.execute(request).await?;
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        parse_send_receipt(&body)
    }
}

/// Append path segments to the base URL; segments are percent-encoded.
pub(crate) fn endpoint_url(base_url: &Url, segments: &[&str]) -> Result<Url, SyncError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| invalid_base_url(base_url))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn history_url(
    base_url: &Url,
    thread_id: &str,
    limit: u16,
    order: HistoryOrder,
) -> Result<Url, SyncError> {
    let mut url = endpoint_url(base_url, &["conversations", thread_id, "messages"])?;
    url.query_pairs_mut()
        .append_pair("limit", &limit.to_string())
        .append_pair("order", order.as_query_value());
    Ok(url)
}

/// Image uploads may answer with an empty body; that is a receipt without id.
fn parse_send_receipt(body: &[u8]) -> Result<SendReceipt, SyncError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SendReceipt::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        SyncError::new(SyncErrorCategory::Serialization, "decode_error", err.to_string())
    })
}

async fn check_status(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_secs = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();

    let mut error = SyncError::new(
        classify_http_status(status.as_u16()),
        "http_status",
        format!("{status}: {preview}"),
    );
    if let Some(secs) = retry_after_secs {
        error = error.with_retry_after(Duration::from_secs(secs));
    }
    Err(error)
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::new(SyncErrorCategory::Serialization, "decode_error", err.to_string())
    } else if err.is_timeout() {
        SyncError::new(SyncErrorCategory::Network, "http_timeout", err.to_string())
    } else if let Some(status) = err.status() {
        SyncError::new(classify_http_status(status.as_u16()), "http_status", err.to_string())
    } else {
        SyncError::new(SyncErrorCategory::Network, "http_transport_error", err.to_string())
    }
}

pub(crate) fn map_credential_error(err: CredentialError) -> SyncError {
    match err {
        CredentialError::NotFound => SyncError::new(
            SyncErrorCategory::Auth,
            "credential_not_found",
            "no session credential is stored",
        ),
        CredentialError::Unavailable(message) => SyncError::new(
            SyncErrorCategory::Storage,
            "credential_store_unavailable",
            message,
        ),
        CredentialError::Backend(message) => {
            SyncError::new(SyncErrorCategory::Storage, "credential_store_error", message)
        }
    }
}

fn invalid_base_url(base_url: &Url) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Config,
        "invalid_api_url",
        format!("API URL '{base_url}' cannot carry a path"),
    )
}

#[cfg(test)]
mod tests {
    use sync_core::{MessageContent, MessageId, Origin};
    use sync_platform::StaticCredential;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;

    /// Serve exactly one HTTP request and return its raw head and body.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener has an address");

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("client should connect");
            let mut received = Vec::new();
            let mut buf = [0_u8; 4096];
            let head_end = loop {
                let read = stream.read(&mut buf).await.expect("request should be readable");
                assert!(read > 0, "client closed before sending a full request");
                received.extend_from_slice(&buf[..read]);
                if let Some(pos) = received.windows(4).position(|window| window == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&received[..head_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while received.len() < head_end + content_length {
                let read = stream.read(&mut buf).await.expect("body should be readable");
                assert!(read > 0, "client closed before sending the body");
                received.extend_from_slice(&buf[..read]);
            }

            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .await
                .expect("response should be written");
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&received).to_string()
        });

        let url = Url::parse(&format!("http://{addr}/api/")).expect("valid url");
        (url, task)
    }

    fn api(base_url: Url, token: Option<&str>) -> HttpChatApi {
        let credentials = match token {
            Some(token) => StaticCredential::new(token),
            None => StaticCredential::none(),
        };
        let http = Client::builder()
            .no_proxy()
            .build()
            .expect("client should build");
        HttpChatApi::with_client(http, base_url, Arc::new(credentials))
    }

    #[test]
    fn builds_percent_encoded_endpoints() {
        let base = Url::parse("https://chat.example.com/api").expect("valid url");
        let url = endpoint_url(&base, &["conversations", "T 1/2", "messages"]).expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://chat.example.com/api/conversations/T%201%2F2/messages"
        );

        let with_slash = Url::parse("https://chat.example.com/api/").expect("valid url");
        let url = endpoint_url(&with_slash, &["conversations"]).expect("endpoint");
        assert_eq!(url.as_str(), "https://chat.example.com/api/conversations");
    }

    #[test]
    fn history_url_carries_limit_and_order() {
        let base = Url::parse("https://chat.example.com/api/").expect("valid url");
        let url = history_url(&base, "T1", 30, HistoryOrder::Descending).expect("history url");
        assert_eq!(
            url.as_str(),
            "https://chat.example.com/api/conversations/T1/messages?limit=30&order=desc"
        );
    }

    #[test]
    fn rejects_base_url_without_path() {
        let base = Url::parse("mailto:ops@example.com").expect("valid url");
        let err = HttpChatApi::new(base, Arc::new(StaticCredential::none()))
            .expect_err("mailto base must fail");
        assert_eq!(err.code, "invalid_api_url");
    }

    #[test]
    fn empty_send_body_is_receipt_without_id() {
        assert_eq!(parse_send_receipt(b""), Ok(SendReceipt::default()));
        assert_eq!(
            parse_send_receipt(br#"{"message_id":"m-9"}"#),
            Ok(SendReceipt {
                message_id: Some("m-9".into())
            })
        );
        let err = parse_send_receipt(b"<html>").expect_err("html is not a receipt");
        assert_eq!(err.category, SyncErrorCategory::Serialization);
    }

    #[test]
    fn credential_errors_map_to_stable_codes() {
        assert_eq!(
            map_credential_error(CredentialError::NotFound).category,
            SyncErrorCategory::Auth
        );
        assert_eq!(
            map_credential_error(CredentialError::Unavailable("locked".into())).code,
            "credential_store_unavailable"
        );
    }

    #[tokio::test]
    async fn lists_conversations_with_bearer_token() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK",
            r#"[{"thread_id":"T1","display_name":"Front desk","kind":"group",
                "last_message_preview":"Hi","last_message_at_ms":10},
               {"thread_id":"T2","display_name":"Dana","kind":"direct"}]"#,
        )
        .await;

        let conversations = api(base, Some("tok-1"))
            .list_conversations()
            .await
            .expect("list should succeed");

        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].thread_id, "T1");
        assert_eq!(conversations[1].last_message_preview, None);

        let request = server.await.expect("server task should finish");
        assert!(request.starts_with("GET /api/conversations HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok-1"));
    }

    #[tokio::test]
    async fn history_entries_become_confirmed_messages() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK",
            r#"[{"thread_id":"T1","message_id":"m-2","is_self":true,
                 "content":{"kind":"text","body":"second"},"timestamp_ms":2},
                {"thread_id":"T1","message_id":"m-1","is_self":false,"sender_name":"Dana",
                 "content":{"kind":"text","body":"first"},"timestamp_ms":1}]"#,
        )
        .await;

        let messages = api(base, None)
            .fetch_history("T1", 30, HistoryOrder::Descending)
            .await
            .expect("history should load");

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, MessageId::Server("m-2".into()));
        assert_eq!(messages[0].origin, Origin::Own);
        assert_eq!(messages[1].content, MessageContent::text("first"));

        let request = server.await.expect("server task should finish");
        assert!(request.starts_with("GET /api/conversations/T1/messages?limit=30&order=desc"));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn sends_text_as_json() {
        let (base, server) = serve_once("HTTP/1.1 201 Created", r#"{"message_id":"m-42"}"#).await;

        let receipt = api(base, Some("tok"))
            .send_message("T1", &OutgoingContent::Text(" Hello ".into()))
            .await
            .expect("send should succeed");

        assert_eq!(receipt.message_id.as_deref(), Some("m-42"));
        let request = server.await.expect("server task should finish");
        assert!(request.starts_with("POST /api/conversations/T1/messages HTTP/1.1"));
        assert!(request.ends_with(r#"{"text":"Hello"}"#));
    }

    #[tokio::test]
    async fn maps_error_status_to_category_and_retry_hint() {
        let (base, server) = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7",
            r#"{"error":"slow down"}"#,
        )
        .await;

        let err = api(base, Some("tok"))
            .list_conversations()
            .await
            .expect_err("429 must fail");

        assert_eq!(err.category, SyncErrorCategory::RateLimited);
        assert_eq!(err.code, "http_status");
        assert_eq!(err.retry_after_ms, Some(7_000));
        assert!(err.message.contains("slow down"));
        server.await.expect("server task should finish");
    }

    #[tokio::test]
    async fn undecodable_body_is_serialization_error() {
        let (base, server) = serve_once("HTTP/1.1 200 OK", r#"{"not":"a list"}"#).await;

        let err = api(base, None)
            .list_conversations()
            .await
            .expect_err("object is not a conversation list");

        assert_eq!(err.category, SyncErrorCategory::Serialization);
        server.await.expect("server task should finish");
    }
}
