//! Stats command implementation

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::backend::HistoryBackend;

pub fn run(backend: &mut HistoryBackend) -> Result<()> {
    let now = Utc::now();

    let week = backend.get_history_count(now - Duration::days(7), now);
    let month = backend.get_history_count(now - Duration::days(30), now);
    let hosts = backend.count_unique_hosts_visited_last_month(now);

    println!("History entries, last 7 days:  {week}");
    println!("History entries, last 30 days: {month}");
    println!("Unique hosts, last 30 days:    {hosts}");
    if let Some(first) = backend.first_recorded_time() {
        println!("Earliest recorded visit:       {}", first.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}
