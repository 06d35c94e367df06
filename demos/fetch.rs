use std::{sync::Arc, time::Duration};

use resilient_http::{CircuitBreaker, HttpClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resilient_http=debug".into()),
        )
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "/".to_owned());
    let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(15))?);

    let client = HttpClient::from_env()?;
    let policy = client
        .policy()
        .clone()
        .with_backoff_base(0.2)
        .with_retry_on_429(true);
    let client = client
        .with_policy(policy)
        .with_breaker(breaker)
        .with_hook(|event| println!("event: {event:?}"));

    if std::env::var("RESILIENT_HTTP_PAGINATE").is_ok() {
        let items = client.get_json_list_paginated(&path).await?;
        println!("{} items", items.len());
        for item in items {
            println!("{item}");
        }
    } else {
        let object = client.get_json_dict(&path).await?;
        println!("{}", serde_json::to_string_pretty(&object)?);
    }

    Ok(())
}
