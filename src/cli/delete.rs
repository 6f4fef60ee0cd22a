//! Delete command implementation

use anyhow::Result;

use crate::backend::HistoryBackend;

pub fn run(backend: &mut HistoryBackend, urls: &[String]) -> Result<()> {
    if urls.is_empty() {
        println!("Nothing to delete.");
        return Ok(());
    }
    backend.delete_urls(urls);
    println!("Deleted {} URL(s) from history.", urls.len());
    Ok(())
}
