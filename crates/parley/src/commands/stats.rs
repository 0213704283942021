//! Stats command - shows connection and cache statistics of a running server.

use anyhow::{Context as _, Result};
use clap::Args;
use console::{Style, style};
use serde_json::Value;

use super::Context;

/// Arguments for the stats command.
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Server URL
    #[arg(long, env = "PARLEY_SERVER_URL", default_value = "http://localhost:8080")]
    pub server: String,
}

/// Run the stats command.
pub async fn run(args: StatsArgs, ctx: &Context) -> Result<()> {
    let url = format!("{}/stats", args.server.trim_end_matches('/'));
    let stats = fetch(&url).await;

    let stats = match stats {
        Ok(stats) => stats,
        Err(e) => {
            let red = Style::new().red();
            let dim = Style::new().dim();
            println!();
            println!("  {} {}", dim.apply_to("Server:"), args.server);
            println!("  {} {}", dim.apply_to("Status:"), red.apply_to("● not reachable"));
            if ctx.verbose {
                println!("  {} {:#}", dim.apply_to("Error:"), e);
            }
            println!();
            println!("  {}", dim.apply_to("Start the server with: parley start"));
            println!();
            return Err(e);
        }
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    print!("{}", render(&args.server, &stats));
    Ok(())
}

async fn fetch(url: &str) -> Result<Value> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?;
    Ok(resp.json().await?)
}

fn count(value: &Value) -> u64 {
    value.as_u64().unwrap_or(0)
}

/// Human-readable summary of a `/stats` document.
fn render(server: &str, stats: &Value) -> String {
    let dim = Style::new().dim();
    let status = stats["cache"]["health"]["status"].as_str().unwrap_or("unknown");
    let status_style = match status {
        "healthy" => Style::new().green(),
        "degraded" => Style::new().yellow(),
        _ => Style::new().red(),
    };
    let connections = &stats["connections"];
    let performance = &stats["cache"]["performance"];
    let cleanup = &stats["cache"]["cleanup"];

    let mut out = String::new();
    out.push('\n');
    out.push_str(&format!("{}\n", style("Parley Server Stats").bold()));
    out.push_str(&format!("{}\n\n", dim.apply_to("─".repeat(40))));
    out.push_str(&format!("  {} {}\n", dim.apply_to("Server:"), server));
    out.push_str(&format!(
        "  {} {}\n",
        dim.apply_to("Cache:"),
        status_style.apply_to(format!("● {status}"))
    ));
    out.push_str(&format!(
        "  {} {} connections, {} sessions, {} users\n",
        dim.apply_to("Live:"),
        count(&connections["total_connections"]),
        count(&connections["total_sessions"]),
        count(&connections["total_users"]),
    ));
    if performance.is_object() {
        out.push_str(&format!(
            "  {} {} responses, {} products, {} searches, {} embeddings\n",
            dim.apply_to("Cached:"),
            count(&performance["agent_responses"]),
            count(&performance["product_info"]),
            count(&performance["search_results"]),
            count(&performance["embeddings"]),
        ));
    }
    out.push_str(&format!(
        "  {} {} runs, {} failures, {} sessions and {} counters removed\n",
        dim.apply_to("Cleanup:"),
        count(&cleanup["runs"]),
        count(&cleanup["failures"]),
        count(&cleanup["sessions_removed"]),
        count(&cleanup["rate_limits_removed"]),
    ));
    out.push('\n');
    out
}
