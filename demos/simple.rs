use std::time::Duration;

use log::info;

use coap_client::{ClientConfig, ClientError, CoapClient, Endpoint, Security};

/// Try `cargo run --example simple -- coap.me:5683`.  Set `COAP_PSK_IDENTITY` and `COAP_PSK`
/// to talk DTLS instead.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let authority = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost".to_string());
    let mut endpoint: Endpoint = authority.parse()?;
    if let Ok(security) = Security::psk_from_env("COAP_PSK_IDENTITY", "COAP_PSK") {
        endpoint = endpoint.with_security(security);
    }

    let client = CoapClient::new(endpoint, ClientConfig::new());
    client.connect().await?;

    let timeout = Duration::from_secs(10);
    match client.get("/hello", timeout).await {
        Ok(response) => info!(
            "GET /hello -> {} {}",
            response.code_string(),
            String::from_utf8_lossy(&response.body)
        ),
        Err(ClientError::Timeout(_)) => info!("GET /hello timed out"),
        Err(e) => return Err(e.into()),
    }

    let response = client
        .post("/.s", "application/json", r#"{"hello":"world"}"#, timeout)
        .await?;
    info!("POST /.s -> {}", response.code_string());

    client.close().await?;
    Ok(())
}
