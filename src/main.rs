use alloy::primitives::Address;
use chrono::Utc;
use clap::Parser;
use conflux_web::{
    cli::{Cli, Commands},
    RpcClient,
};
use eyre::{Result, WrapErr};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let client = RpcClient::from_endpoint(&cli.url)
        .await
        .wrap_err_with(|| format!("Failed to connect to {}", cli.url))?;

    match cli.command {
        Commands::Call { method, params } => {
            let params: Vec<Value> =
                serde_json::from_str(&params).wrap_err("Params must be a JSON array")?;
            let result = client.send(&method, params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::GetBalance { address, block } => {
            let address: Address = address.parse()?;
            let method = format!("{}_getBalance", cli.namespace);
            let balance = client
                .send(&method, vec![json!(address.to_string()), json!(block)])
                .await?;
            info!("Balance for {address}:");
            info!("  Raw: {}", balance);
        }
        Commands::Subscribe { kind, count } => {
            let subscribe_method = format!("{}_subscribe", cli.namespace);
            let mut subscription = client.subscribe(&subscribe_method, &kind, vec![]).await?;
            info!("Awaiting {} notifications...", count);

            let mut received = 0;
            while received < count {
                match subscription.next().await {
                    Some(Ok(payload)) => {
                        received += 1;
                        info!("[{}] #{}/{} {}", Utc::now().format("%H:%M:%S%.3f"), received, count, payload);
                    }
                    Some(Err(e)) => error!("Subscription error: {}", e),
                    None => {
                        error!("Subscription ended");
                        break;
                    }
                }
            }

            let unsubscribe_method = format!("{}_unsubscribe", cli.namespace);
            let removed = client
                .unsubscribe(subscription.id(), &unsubscribe_method)
                .await?;
            info!("Unsubscribed: {}", removed);
            client.disconnect();
        }
        Commands::Batch { methods } => {
            let mut batch = client.batch();
            for method in &methods {
                batch = batch.add(method, vec![]);
            }
            for (method, result) in methods.iter().zip(batch.execute().await?) {
                match result {
                    Ok(value) => info!("{}: {}", method, value),
                    Err(e) => error!("{}: {}", method, e),
                }
            }
        }
    }

    Ok(())
}
