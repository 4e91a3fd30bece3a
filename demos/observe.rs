use std::time::Duration;

use log::{info, warn};

use coap_client::{ClientConfig, CoapClient, Endpoint, Notification};

/// Observes `/obs` for 30 seconds.  Try `cargo run --example observe -- coap.me:5683`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let authority = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost".to_string());
    let endpoint: Endpoint = authority.parse()?;

    let client = CoapClient::new(endpoint, ClientConfig::new());
    client.connect().await?;

    let mut failures = client
        .callback_errors()
        .await
        .ok_or_else(|| anyhow::anyhow!("callback error channel already taken"))?;
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            warn!("Callback for {} failed: {}", failure.path, failure.reason);
        }
    });

    let lifetime = Duration::from_secs(30);
    let handle = client
        .observe("/obs", lifetime, |n: Notification| {
            let body = std::str::from_utf8(&n.body)?;
            info!("#{:?}: {body}", n.sequence);
            Ok(())
        })
        .await?;

    tokio::time::sleep(lifetime).await;
    info!("Observation of {} active: {}", handle.path(), handle.is_active().await);
    client.close().await?;
    Ok(())
}
