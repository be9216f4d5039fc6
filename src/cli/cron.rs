//! Cron inspection command handler.

use anyhow::Result;
use chrono::Utc;

use yoctoclaw::config::Config;
use yoctoclaw::scheduler::CronExpr;

use super::CronAction;

pub async fn cmd_cron(action: CronAction) -> Result<()> {
    match action {
        CronAction::List => cmd_list(),
    }
}

fn cmd_list() -> Result<()> {
    let config = Config::load()?;
    if config.scheduler.cron.is_empty() {
        println!("No cron entries configured.");
        return Ok(());
    }

    let now = Utc::now();
    for entry in &config.scheduler.cron {
        // Config::load already validated these, so parse cannot fail here
        // unless the file changed underneath us.
        let expr = CronExpr::parse(&entry.expr)?;
        let next = expr
            .next_after(now)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let target = entry.session_key.as_deref().unwrap_or("(global)");
        println!(
            "{:<16} {:<16} {:<20} next: {}",
            entry.name, entry.expr, target, next
        );
    }
    Ok(())
}
