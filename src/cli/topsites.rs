//! Top-sites command implementation

use anyhow::Result;
use chrono::Utc;

use crate::backend::HistoryBackend;

pub fn run(backend: &mut HistoryBackend, count: usize) -> Result<()> {
    let sites = backend.query_most_visited_urls(count, Utc::now());

    if sites.is_empty() {
        println!("No scored sites yet.");
        return Ok(());
    }

    println!("{:<8} {:<8} {}", "Score", "Visits", "URL");
    println!("{}", "-".repeat(80));
    for site in &sites {
        println!("{:<8.2} {:<8} {}", site.score, site.visit_count, site.url);
    }
    Ok(())
}
