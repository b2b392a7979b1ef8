use anyhow::{bail, Context, Result};
use zlayer_relay::server::ForwardMode;
use zlayer_relay::{RegisterRequest, RegisterResponse};

/// Body for a registration call
pub(crate) fn registration_body(local_api: Option<String>, relay: bool) -> RegisterRequest {
    RegisterRequest {
        mode: relay.then_some(ForwardMode::Relay),
        local_api,
    }
}

/// Register an origin with the relay and print the response as JSON
pub(crate) async fn register(server: &str, local_api: Option<String>, relay: bool) -> Result<()> {
    let url = format!("{}/register", server.trim_end_matches('/'));
    let body = registration_body(local_api, relay);

    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach relay at {url}"))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("registration failed ({status}): {text}");
    }

    let registration: RegisterResponse = response
        .json()
        .await
        .context("invalid registration response")?;
    println!("{}", serde_json::to_string_pretty(&registration)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_body_direct() {
        let body = registration_body(Some("http://localhost:3000".to_string()), false);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["local_api"], "http://localhost:3000");
        assert!(json.get("mode").map_or(true, serde_json::Value::is_null));
    }

    #[test]
    fn test_registration_body_relay() {
        let json = serde_json::to_value(registration_body(None, true)).unwrap();
        assert_eq!(json["mode"], "relay");
    }

    #[tokio::test]
    async fn test_register_unreachable_relay() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(register(&format!("http://{addr}"), None, true).await.is_err());
    }
}
