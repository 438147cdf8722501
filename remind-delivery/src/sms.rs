use anyhow::{anyhow, Result};
use async_trait::async_trait;
use remind_core::config::SmsConfig;
use remind_core::types::mask_recipient;
use remind_core::{GatewayError, SmsGateway};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing;

/// Recorded when Twilio accepted a message but its response had no readable sid.
pub const UNKNOWN_SID: &str = "unknown";

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

struct TwilioCredentials {
    account_sid: String,
    auth_token: String,
    from_number: String,
}

/// SMS delivery through the Twilio Messages API.
pub struct TwilioGateway {
    client: Arc<reqwest::Client>,
    credentials: Option<TwilioCredentials>,
    api_base: String,
}

impl TwilioGateway {
    pub fn new(config: &SmsConfig, timeout: Duration) -> Result<Self> {
        let credentials = match (
            &config.twilio_account_sid,
            &config.twilio_auth_token,
            &config.twilio_from_number,
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => {
                tracing::info!("Initializing Twilio SMS client");
                Some(TwilioCredentials {
                    account_sid: account_sid.clone(),
                    auth_token: auth_token.clone(),
                    from_number: from_number.clone(),
                })
            }
            _ => {
                tracing::warn!("SMS delivery disabled (missing Twilio configuration)");
                None
            }
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client: Arc::new(client),
            credentials,
            api_base: config.twilio_api_base.trim_end_matches('/').to_string(),
        })
    }
}

/// 429 and 5xx are worth another try; any other refusal will not change.
fn classify(status: StatusCode, detail: String) -> GatewayError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GatewayError::Transient(format!("Twilio returned {}: {}", status, detail))
    } else {
        GatewayError::Permanent(format!("Twilio returned {}: {}", status, detail))
    }
}

#[async_trait]
impl SmsGateway for TwilioGateway {
    async fn send(&self, recipient: &str, text: &str) -> Result<String, GatewayError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| GatewayError::Permanent("Twilio is not configured".to_string()))?;

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, creds.account_sid
        );
        let form = [
            ("To", recipient),
            ("From", creds.from_number.as_str()),
            ("Body", text),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(&creds.account_sid, Some(&creds.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("Failed to reach Twilio: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<TwilioErrorResponse>().await {
                Ok(err) => format!(
                    "{} (code {})",
                    err.message.unwrap_or_else(|| "unknown error".to_string()),
                    err.code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
                ),
                Err(_) => "unreadable error body".to_string(),
            };
            return Err(classify(status, detail));
        }

        // Twilio accepted the message. Past this point the send is confirmed
        // and must not come back as an error, or the worker would resend it.
        let sid = match response.json::<TwilioMessageResponse>().await {
            Ok(message) => message.sid,
            Err(e) => {
                tracing::warn!(
                    "Twilio accepted SMS to {} with status {} but the body was unreadable: {}",
                    mask_recipient(recipient),
                    status,
                    e
                );
                UNKNOWN_SID.to_string()
            }
        };

        tracing::debug!("SMS sent to {} (sid: {})", mask_recipient(recipient), sid);

        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::followup::MemoryFollowupLog;
    use crate::worker::{DeliveryOutcome, DeliveryWorker};
    use assert_matches::assert_matches;
    use chrono::{Duration as ChronoDuration, Utc};
    use remind_core::config::SchedulingConfig;
    use remind_core::types::NewNotification;
    use remind_core::{DeliveryJob, MemoryStore, NotificationRepo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert_matches!(classify(StatusCode::TOO_MANY_REQUESTS, String::new()), GatewayError::Transient(_));
        assert_matches!(classify(StatusCode::BAD_GATEWAY, String::new()), GatewayError::Transient(_));
    }

    #[test]
    fn client_errors_are_permanent() {
        assert_matches!(classify(StatusCode::BAD_REQUEST, String::new()), GatewayError::Permanent(_));
        assert_matches!(classify(StatusCode::UNAUTHORIZED, String::new()), GatewayError::Permanent(_));
    }

    /// Reads headers and the `Content-Length` body of one request.
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    /// Serves `responses` in order, one connection each, and counts requests.
    async fn serve(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for body in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                counter.fetch_add(1, Ordering::SeqCst);
                socket.write_all(body.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (format!("http://{}", addr), hits)
    }

    fn configured(api_base: String) -> SmsConfig {
        SmsConfig {
            twilio_account_sid: Some("AC123".to_string()),
            twilio_auth_token: Some("secret".to_string()),
            twilio_from_number: Some("+15550000000".to_string()),
            twilio_api_base: api_base,
        }
    }

    const CREATED_HTML: &str = "HTTP/1.1 201 Created\r\nContent-Type: text/html\r\nContent-Length: 21\r\nConnection: close\r\n\r\n<html>accepted</html>";
    const CREATED_JSON: &str = "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 16\r\nConnection: close\r\n\r\n{\"sid\":\"SM42ab\"}";
    const UNAVAILABLE: &str = "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    #[tokio::test]
    async fn accepted_send_returns_sid() {
        let (base, hits) = serve(vec![CREATED_JSON]).await;
        let gateway = TwilioGateway::new(&configured(base), Duration::from_secs(5)).unwrap();

        assert_eq!(gateway.send("+15550001111", "hi").await, Ok("SM42ab".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let (base, _hits) = serve(vec![UNAVAILABLE]).await;
        let gateway = TwilioGateway::new(&configured(base), Duration::from_secs(5)).unwrap();

        assert_matches!(gateway.send("+15550001111", "hi").await, Err(GatewayError::Transient(_)));
    }

    #[tokio::test]
    async fn accepted_send_with_unreadable_body_is_delivered_once() {
        let (base, hits) = serve(vec![CREATED_HTML, CREATED_HTML, CREATED_HTML]).await;
        let gateway = Arc::new(TwilioGateway::new(&configured(base), Duration::from_secs(5)).unwrap());
        let store = Arc::new(MemoryStore::new());
        let n = store
            .insert(&NewNotification::one_time(
                "+15550001111",
                "pick up prescription",
                Utc::now() - ChronoDuration::minutes(1),
            ))
            .await
            .unwrap();
        let worker = DeliveryWorker::new(
            store.clone(),
            gateway,
            Arc::new(MemoryFollowupLog::new()),
            &SchedulingConfig::default(),
        );

        let claimed = store.claim_due(10, Duration::from_secs(300)).await.unwrap();
        let outcome = worker.deliver(&DeliveryJob::from(&claimed[0])).await;

        assert_matches!(outcome, Ok(DeliveryOutcome::Sent { attempts: 1 }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(store.get(n.id).await.unwrap().unwrap().sent);
    }

    #[tokio::test]
    async fn unconfigured_gateway_refuses_permanently() {
        let config = SmsConfig {
            twilio_account_sid: None,
            twilio_auth_token: None,
            twilio_from_number: None,
            twilio_api_base: "https://api.twilio.com".to_string(),
        };
        let gateway = TwilioGateway::new(&config, Duration::from_secs(5)).unwrap();
        assert_matches!(gateway.send("+15550001111", "hi").await, Err(GatewayError::Permanent(_)));
    }
}
