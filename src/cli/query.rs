//! Query command implementation

use anyhow::Result;

use crate::backend::HistoryBackend;
use crate::types::QueryOptions;

pub fn run(backend: &mut HistoryBackend, text: Option<&str>, max: usize) -> Result<()> {
    let options = QueryOptions {
        max_count: max,
        ..Default::default()
    };
    let results = backend.query_history(text, &options);

    if results.results.is_empty() {
        println!("No matching history entries.");
        return Ok(());
    }

    println!("{:<17} {:<50} {}", "Visited", "URL", "Title");
    println!("{}", "-".repeat(100));
    for result in &results.results {
        let title = result.row.title.lines().next().unwrap_or("");
        println!(
            "{:<17} {:<50} {}",
            result.visit_time.format("%Y-%m-%d %H:%M"),
            truncate(&result.row.url, 48),
            truncate(title, 35),
        );
    }
    if !results.reached_beginning {
        println!("(more results before this window)");
    }
    Ok(())
}

pub fn show_url(backend: &mut HistoryBackend, url: &str) -> Result<()> {
    let Some(result) = backend.query_url(url, true) else {
        println!("URL not found in history.");
        return Ok(());
    };

    println!("URL:         {}", result.row.url);
    println!("Title:       {}", result.row.title);
    println!("Visits:      {}", result.row.visit_count);
    println!("Typed:       {}", result.row.typed_count);
    if let Some(last) = result.row.last_visit {
        println!("Last visit:  {}", last.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
    for visit in &result.visits {
        println!(
            "  {}  visit {}  from {}  {:?}",
            visit.visit_time.format("%Y-%m-%d %H:%M:%S"),
            visit.id,
            visit.referring_visit,
            visit.transition.core(),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max - 3).collect();
        format!("{cut}...")
    } else {
        s.to_string()
    }
}
