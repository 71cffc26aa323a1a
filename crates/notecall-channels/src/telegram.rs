//! Telegram Bot channel: sends reminders via the Bot API.
//!
//! Each note goes out in its own medium (`sendPhoto`, `sendVoice`, ...) with
//! the reminder text as caption. A note whose file is gone is sent as text.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use notecall_core::config::TelegramConfig;
use notecall_core::traits::DeliveryChannel;
use notecall_core::{DeliveryError, Note, NoteKind, NotecallError, Result};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

/// Telegram limit for message text.
const MAX_MESSAGE_CHARS: usize = 4096;
/// Telegram limit for media captions.
const MAX_CAPTION_CHARS: usize = 1024;

/// Delivers reminders through a Telegram bot.
pub struct TelegramDelivery {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramDelivery {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(NotecallError::Config(
                "telegram.bot_token is empty (set TELEGRAM_BOT_TOKEN)".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotecallError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    /// Send a text message.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> std::result::Result<(), DeliveryError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": truncate_chars(text, MAX_MESSAGE_CHARS),
        });
        let request = self.client.post(self.api_url("sendMessage")).json(&body);
        self.call("sendMessage", request).await
    }

    /// Upload `file` with `method` (`sendPhoto`, `sendVoice`, ...).
    pub async fn send_media(
        &self,
        chat_id: &str,
        method: &str,
        field: &'static str,
        file: &Path,
        bytes: Vec<u8>,
        caption: &str,
    ) -> std::result::Result<(), DeliveryError> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| field.to_string());
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", truncate_chars(caption, MAX_CAPTION_CHARS))
            .part(field, Part::bytes(bytes).file_name(file_name));
        let request = self.client.post(self.api_url(method)).multipart(form);
        self.call(method, request).await
    }

    async fn call(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<(), DeliveryError> {
        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("{method} failed: {e}")))?;
        let status = response.status().as_u16();

        let body: TelegramApiResponse<serde_json::Value> = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return Err(classify_status(
                    status,
                    &format!("invalid {method} response: {e}"),
                ));
            }
        };

        if body.ok {
            let message_id = body
                .result
                .as_ref()
                .and_then(|r| r.get("message_id"))
                .and_then(serde_json::Value::as_i64);
            tracing::debug!("✉️ {method} ok (message_id: {message_id:?})");
            return Ok(());
        }
        let code = body
            .error_code
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(status);
        Err(classify_status(
            code,
            &format!("{method}: {}", body.description.unwrap_or_default()),
        ))
    }
}

#[async_trait]
impl DeliveryChannel for TelegramDelivery {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, user: &str, note: &Note) -> std::result::Result<(), DeliveryError> {
        let text = note.reminder_text();
        let Some((method, field)) = media_method(note.kind) else {
            return self.send_message(user, &text).await;
        };
        let Some(path) = note.payload_ref.as_deref().map(Path::new) else {
            tracing::warn!("📎 {} note {} has no file, sending text", note.kind, note.id);
            return self.send_message(user, &text).await;
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    "📎 File for note {} unavailable ({}: {e}), sending text",
                    note.id,
                    path.display()
                );
                return self.send_message(user, &text).await;
            }
        };
        self.send_media(user, method, field, path, bytes, &text).await
    }

    async fn deliver_text_fallback(
        &self,
        user: &str,
        text: &str,
    ) -> std::result::Result<(), DeliveryError> {
        self.send_message(user, text).await
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
}

/// Bot API method and multipart field for a media note.
fn media_method(kind: NoteKind) -> Option<(&'static str, &'static str)> {
    match kind {
        NoteKind::Text => None,
        NoteKind::Image => Some(("sendPhoto", "photo")),
        NoteKind::Voice => Some(("sendVoice", "voice")),
        NoteKind::Document => Some(("sendDocument", "document")),
        NoteKind::Video => Some(("sendVideo", "video")),
        NoteKind::Audio => Some(("sendAudio", "audio")),
    }
}

/// Bad request, blocked bot, unknown chat: retrying cannot help.
/// Rate limits, server errors and everything else can.
fn classify_status(code: u16, description: &str) -> DeliveryError {
    match code {
        400 | 401 | 403 | 404 => DeliveryError::Permanent(format!("HTTP {code}: {description}")),
        _ => DeliveryError::Transient(format!("HTTP {code}: {description}")),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: &str) -> TelegramConfig {
        TelegramConfig {
            bot_token: token.into(),
            ..TelegramConfig::default()
        }
    }

    #[test]
    fn test_requires_token() {
        assert!(matches!(
            TelegramDelivery::new(config("  ")),
            Err(NotecallError::Config(_))
        ));
    }

    #[test]
    fn test_api_url() {
        let mut cfg = config("123:abc");
        cfg.api_base = "http://localhost:8081/".into();
        let tg = TelegramDelivery::new(cfg).unwrap();
        assert_eq!(tg.api_url("sendPhoto"), "http://localhost:8081/bot123:abc/sendPhoto");
    }

    #[test]
    fn test_media_methods() {
        assert_eq!(media_method(NoteKind::Text), None);
        assert_eq!(media_method(NoteKind::Image), Some(("sendPhoto", "photo")));
        assert_eq!(media_method(NoteKind::Audio), Some(("sendAudio", "audio")));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(403, "Forbidden: bot was blocked by the user"),
            DeliveryError::Permanent(_)
        ));
        assert!(matches!(classify_status(400, "chat not found"), DeliveryError::Permanent(_)));
        assert!(matches!(classify_status(429, "Too Many Requests"), DeliveryError::Transient(_)));
        assert!(matches!(classify_status(502, "Bad Gateway"), DeliveryError::Transient(_)));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("📚📚📚", 2), "📚📚");
    }

    #[test]
    fn test_parse_api_error() {
        let body: TelegramApiResponse<serde_json::Value> = serde_json::from_str(
            r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#,
        )
        .unwrap();
        assert!(!body.ok);
        assert_eq!(body.error_code, Some(403));
    }

    /// Minimal Bot API stand-in: answers one request with `reply` and hands
    /// back the request line.
    async fn serve_once(reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            // Read headers, then the whole body so the client sees a clean close.
            let header_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                reply.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            head.lines().next().unwrap_or_default().to_string()
        });
        (base, handle)
    }

    #[tokio::test]
    async fn test_missing_media_file_is_sent_as_text() {
        let (base, server) =
            serve_once(r#"{"ok":true,"result":{"message_id":7}}"#).await;
        let mut cfg = config("123:abc");
        cfg.api_base = base;
        let tg = TelegramDelivery::new(cfg).unwrap();

        let note = Note::media(
            5,
            "42",
            NoteKind::Image,
            "/nonexistent/notecall/photo.jpg",
            "sunset",
        );
        tg.deliver("42", &note).await.unwrap();

        let request_line = server.await.unwrap();
        assert!(
            request_line.starts_with("POST /bot123:abc/sendMessage "),
            "unexpected request: {request_line}"
        );
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transient() {
        let mut cfg = config("123:abc");
        // Nothing listens on port 9 locally.
        cfg.api_base = "http://127.0.0.1:9".into();
        cfg.timeout_secs = 2;
        let tg = TelegramDelivery::new(cfg).unwrap();
        let err = tg
            .deliver_text_fallback("42", "📚 Reminder:\nhello")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Transient(_)));
    }
}
