use anyhow::Result;
use consumption_sync::{
    app,
    config::AppConfig,
    observability,
    provider::{ProviderClient, SessionManager},
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let sessions = SessionManager::new(Arc::new(app::provider_client(&cfg)), cfg.credentials()?);

    let session = sessions.session().await?;
    let contracts = sessions.provider().installations(&session).await?;

    println!("{:<16} {:<12} {:<12}", "installation", "move_in", "move_out");
    for c in &contracts {
        let move_out = c.move_out.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{:<16} {:<12} {:<12}", c.installation_id, c.move_in.to_string(), move_out);
    }
    tracing::info!(count = contracts.len(), "listed provider installations");

    Ok(())
}
