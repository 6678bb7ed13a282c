use anyhow::{anyhow, bail, Result};
use consumption_client::{db::load_statistics, domain::statistic_id};
use consumption_sync::{app, config::AppConfig, export, observability, transform::calendar};
use std::{env, fs::File, io};
use time::{macros::format_description, Date};

fn parse_date(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .map_err(|e| anyhow!("invalid date {s}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        bail!("usage: export_consumption <installation_id> <from YYYY-MM-DD> <to YYYY-MM-DD, exclusive> [out.csv]");
    }
    let installation_id = &args[1];
    let from = parse_date(&args[2])?;
    let to = parse_date(&args[3])?;

    let cfg = AppConfig::load()?;
    let tz = cfg.timezone()?;
    let start = calendar::day_start_utc(from, tz).ok_or_else(|| anyhow!("no local midnight for {from}"))?;
    let end = calendar::day_start_utc(to, tz).ok_or_else(|| anyhow!("no local midnight for {to}"))?;

    let pool = app::connect_questdb(&cfg).await?;
    let id = statistic_id(&cfg.provider.name, installation_id);
    let rows = load_statistics(&pool, &id, start, end).await?;

    let written = match args.get(4) {
        Some(path) => export::write_csv(&rows, File::create(path)?)?,
        None => export::write_csv(&rows, io::stdout().lock())?,
    };
    tracing::info!(statistic_id = %id, rows = written, "exported consumption statistics");

    Ok(())
}
