//! Hearth CLI
//!
//! Command-line client for a running Hearth API:
//! - List and inspect learned patterns
//! - Reject, reactivate, enable, disable or delete a pattern
//! - Start an analysis pass and check its status

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hearth-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage patterns learned by a Hearth server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:8086", global = true)]
    pub api_url: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List learned patterns
    List {
        /// Filter by status (observed, suggested, active, disabled, rejected, insight)
        #[arg(short, long)]
        status: Option<String>,
        /// Filter by type (time_based, event_chain, correlation)
        #[arg(short = 't', long = "type")]
        pattern_type: Option<String>,
        /// Filter by room
        #[arg(short, long)]
        room: Option<String>,
    },

    /// Show one pattern
    Get {
        id: String,
    },

    /// Reject a pattern; it will not be suggested again
    Reject {
        id: String,
        /// Why the pattern is wrong
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Move a rejected or disabled pattern back to suggested
    Reactivate {
        id: String,
    },

    /// Activate a pattern
    Enable {
        id: String,
    },

    /// Disable a pattern
    Disable {
        id: String,
    },

    /// Toggle test mode
    TestMode {
        id: String,
        /// on or off
        #[arg(value_parser = parse_switch)]
        enabled: bool,
    },

    /// Delete a pattern
    Delete {
        id: String,
    },

    /// Start an analysis pass
    Analyze,

    /// Show server health and the last analysis run
    Status,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = format!("{}/api/v1", cli.api_url.trim_end_matches('/'));

    match cli.command {
        Commands::List {
            status,
            pattern_type,
            room,
        } => {
            let mut query = Vec::new();
            if let Some(status) = status {
                query.push(("status", status));
            }
            if let Some(pattern_type) = pattern_type {
                query.push(("type", pattern_type));
            }
            if let Some(room) = room {
                query.push(("room", room));
            }

            let response = client
                .get(format!("{}/patterns", base))
                .query(&query)
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            let data = expect_json(response).await?;

            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&data)?),
                _ => print_pattern_table(&data),
            }
        }

        Commands::Get { id } => {
            let response = client
                .get(format!("{}/patterns/{}", base, id))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            let pattern = expect_json(response).await?;

            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&pattern)?),
                _ => print_pattern(&pattern),
            }
        }

        Commands::Reject { id, reason } => {
            let body = serde_json::json!({ "reason": reason });
            let response = client
                .post(format!("{}/patterns/{}/reject", base, id))
                .json(&body)
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            report_status(expect_json(response).await?);
        }

        Commands::Reactivate { id } => {
            let response = client
                .post(format!("{}/patterns/{}/reactivate", base, id))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            report_status(expect_json(response).await?);
        }

        Commands::Enable { id } => {
            let response = client
                .post(format!("{}/patterns/{}/enable", base, id))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            report_status(expect_json(response).await?);
        }

        Commands::Disable { id } => {
            let response = client
                .post(format!("{}/patterns/{}/disable", base, id))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            report_status(expect_json(response).await?);
        }

        Commands::TestMode { id, enabled } => {
            let response = client
                .put(format!("{}/patterns/{}/test-mode", base, id))
                .json(&serde_json::json!({ "enabled": enabled }))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            let pattern = expect_json(response).await?;
            println!(
                "{}: test mode {}",
                pattern["id"].as_str().unwrap_or("-"),
                if pattern["test_mode"].as_bool().unwrap_or(false) {
                    "on"
                } else {
                    "off"
                }
            );
        }

        Commands::Delete { id } => {
            let response = client
                .delete(format!("{}/patterns/{}", base, id))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            if !response.status().is_success() {
                return Err(error_from(response).await);
            }
            println!("Deleted {}", id);
        }

        Commands::Analyze => {
            let response = client
                .post(format!("{}/analysis", base))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            let body = expect_json(response).await?;
            match body["status"].as_str() {
                Some("started") => println!("Analysis started"),
                Some("already_running") => println!("An analysis pass is already running"),
                other => println!("Unexpected response: {}", other.unwrap_or("-")),
            }
        }

        Commands::Status => {
            let health = client
                .get(format!("{}/health", cli.api_url.trim_end_matches('/')))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            let health = expect_json(health).await?;

            let status = client
                .get(format!("{}/analysis/status", base))
                .send()
                .await
                .with_context(|| connect_hint(&cli.api_url))?;
            let status = expect_json(status).await?;

            if cli.format == "json" {
                let combined = serde_json::json!({ "health": health, "analysis": status });
                println!("{}", serde_json::to_string_pretty(&combined)?);
                return Ok(());
            }

            println!(
                "Hearth v{}",
                health["version"].as_str().unwrap_or(env!("CARGO_PKG_VERSION"))
            );
            println!();
            println!("API Status: {}", health["status"].as_str().unwrap_or("unknown"));
            println!("Store: {}", health["store"].as_str().unwrap_or("unknown"));
            if let Some(uptime) = health["uptime_seconds"].as_u64() {
                println!("Uptime: {}", format_duration(uptime));
            }
            println!();
            println!(
                "Analysis: {}",
                if status["running"].as_bool().unwrap_or(false) {
                    "running"
                } else {
                    "idle"
                }
            );
            print_last_run(&status["last_run"]);
        }

        Commands::Config { output } => {
            let config = hearth::config::generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        other => Err(format!("expected on or off, got {}", other)),
    }
}

fn connect_hint(api_url: &str) -> String {
    format!(
        "cannot connect to Hearth API at {} (is `hearth-api` running?)",
        api_url
    )
}

/// Decode a JSON body or fail with the server's error message
async fn expect_json(response: reqwest::Response) -> anyhow::Result<serde_json::Value> {
    if !response.status().is_success() {
        return Err(error_from(response).await);
    }
    Ok(response.json().await?)
}

async fn error_from(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(text);
    anyhow::anyhow!("request failed ({}): {}", status, message)
}

fn report_status(pattern: serde_json::Value) {
    println!(
        "{}: {}",
        pattern["id"].as_str().unwrap_or("-"),
        pattern["status"].as_str().unwrap_or("unknown")
    );
}

fn print_pattern_table(data: &serde_json::Value) {
    let patterns = match data["patterns"].as_array() {
        Some(p) if !p.is_empty() => p,
        _ => {
            println!("No patterns match.");
            return;
        }
    };

    println!(
        "{:<36} {:<12} {:<10} {:>5} {:>6} {:<10} {}",
        "ID", "Type", "Status", "Conf", "Count", "Room", "Identity"
    );
    println!("{}", "-".repeat(120));

    for pattern in patterns {
        println!(
            "{:<36} {:<12} {:<10} {:>5.2} {:>6} {:<10} {}",
            pattern["id"].as_str().unwrap_or("-"),
            pattern["pattern_type"].as_str().unwrap_or("-"),
            pattern["status"].as_str().unwrap_or("-"),
            pattern["confidence"].as_f64().unwrap_or(0.0),
            pattern["match_count"].as_u64().unwrap_or(0),
            pattern["room_id"].as_str().unwrap_or("-"),
            pattern["identity_key"].as_str().unwrap_or("-"),
        );
    }

    println!();
    println!("{} pattern(s)", data["total"].as_u64().unwrap_or(0));
}

fn print_pattern(pattern: &serde_json::Value) {
    println!("ID:          {}", pattern["id"].as_str().unwrap_or("-"));
    println!("Identity:    {}", pattern["identity_key"].as_str().unwrap_or("-"));
    println!("Type:        {}", pattern["pattern_type"].as_str().unwrap_or("-"));
    println!("Status:      {}", pattern["status"].as_str().unwrap_or("-"));
    println!(
        "Confidence:  {:.3}",
        pattern["confidence"].as_f64().unwrap_or(0.0)
    );
    println!("Matches:     {}", pattern["match_count"].as_u64().unwrap_or(0));
    println!("Room:        {}", pattern["room_id"].as_str().unwrap_or("-"));
    println!(
        "Last seen:   {}",
        pattern["last_observed_at"].as_str().unwrap_or("-")
    );
    println!(
        "Test mode:   {}",
        pattern["test_mode"].as_bool().unwrap_or(false)
    );
    if let Some(reason) = pattern["rejection_reason"].as_str() {
        println!("Rejected:    {}", reason);
    }
    if let Ok(data) = serde_json::to_string_pretty(&pattern["data"]) {
        println!();
        println!("{}", data);
    }
}

fn print_last_run(last_run: &serde_json::Value) {
    if last_run.is_null() {
        println!("Last run: none");
        return;
    }

    println!(
        "Last run: {} ({})",
        last_run["run_id"].as_str().unwrap_or("-"),
        last_run["outcome"]["state"].as_str().unwrap_or("unknown")
    );
    if let Some(reason) = last_run["outcome"]["reason"].as_str() {
        println!("  Aborted: {}", reason);
    }
    println!("  Started: {}", last_run["started_at"].as_str().unwrap_or("-"));
    println!(
        "  Duration: {} ms",
        last_run["duration_ms"].as_u64().unwrap_or(0)
    );
    println!("  Events read: {}", last_run["events_read"].as_u64().unwrap_or(0));

    if let Some(detectors) = last_run["detectors"].as_array() {
        for detector in detectors {
            println!(
                "  {:<12} candidates {:>4}  near-misses {:>4}{}",
                detector["detector"].as_str().unwrap_or("-"),
                detector["candidates"].as_u64().unwrap_or(0),
                detector["near_misses"].as_u64().unwrap_or(0),
                detector["failed"]
                    .as_str()
                    .map(|e| format!("  FAILED: {}", e))
                    .unwrap_or_default()
            );
        }
    }

    if let Some(deleted) = last_run["janitor_deleted"].as_u64() {
        println!("  Stale patterns removed: {}", deleted);
    }
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}
