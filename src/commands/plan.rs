use anyhow::{Context, Result};
use chrono::Utc;

use postrelay::config::Config;
use postrelay::scheduler::slots;
use postrelay::storage::{PostgresStore, Store};

pub async fn plan(config: Config, task_id: i64, days: u32) -> Result<()> {
    let tz = config.timezone()?;
    let store = PostgresStore::connect(&config.postgres_config())
        .await
        .context("Failed to connect to PostgreSQL")?;

    let tasks = store.load_tasks().await?;
    let task = tasks
        .iter()
        .find(|t| t.id == task_id)
        .with_context(|| format!("Task {task_id} not found"))?;
    let channels = store.load_channels().await?;
    let name = |id: i64| {
        channels
            .iter()
            .find(|c| c.id == id)
            .map_or_else(|| format!("#{id}"), |c| c.name.clone())
    };

    println!("Task #{}: {} -> {}", task.id, name(task.source_id), name(task.target_id));
    println!("  Bot: {}", task.bot_id);
    println!("  Mode: {} / {}", task.choice_mode.as_str(), task.after_publish.as_str());
    println!("  Enabled: {}", task.is_enabled());
    println!("  Time zone: {tz}");
    println!();

    if task.slots.is_empty() {
        println!("No time slots configured.");
        return Ok(());
    }

    let upcoming = slots::upcoming(&task.slots, Utc::now(), tz, days);
    println!("Upcoming slots ({days} days):");
    for at in &upcoming {
        println!("  {}", at.format("%a %Y-%m-%d %H:%M:%S %Z"));
    }
    if upcoming.is_empty() {
        println!("  (none)");
    }

    Ok(())
}
