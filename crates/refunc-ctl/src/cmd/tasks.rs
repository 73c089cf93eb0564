//! Live call listing and function metadata.

use anyhow::Result;
use serde::Deserialize;

use super::http::{get_json, get_text};

#[derive(Deserialize)]
struct TasksResponse {
    tasks: Vec<TaskStat>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskStat {
    id: String,
    created_at: String,
    uptime: String,
    received: u64,
    #[serde(default)]
    published: u64,
}

pub async fn cmd_tasks(base: &str) -> Result<()> {
    let resp: TasksResponse = get_json(&format!("{}/tasks", base)).await?;

    if resp.tasks.is_empty() {
        println!("No calls in flight.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Calls in flight ({})", resp.tasks.len());
    println!("═══════════════════════════════════════");

    for t in &resp.tasks {
        println!("  ┌─ {}", t.id);
        println!("  │  created   : {}", t.created_at);
        println!("  │  received  : {}", t.received);
        if t.published > 0 {
            println!("  │  published : {}", t.published);
        }
        println!("  └─ uptime    : {}", t.uptime);
    }

    Ok(())
}

pub async fn cmd_meta(base: &str, endpoint: &str) -> Result<()> {
    let body = get_text(&format!("{}/{}/_meta", base, endpoint.trim_matches('/'))).await?;
    println!("{}", body.trim_end());
    Ok(())
}
