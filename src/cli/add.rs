//! Add command implementation

use anyhow::Result;
use chrono::Utc;

use crate::backend::{AddPageArgs, HistoryBackend};
use crate::transition::{CoreTransition, PageTransition};

pub fn run(
    backend: &mut HistoryBackend,
    url: &str,
    title: Option<String>,
    typed: bool,
    redirects: Vec<String>,
) -> Result<()> {
    let core = if typed {
        CoreTransition::Typed
    } else {
        CoreTransition::Link
    };

    let mut args = AddPageArgs::new(url, Utc::now(), PageTransition::new(core));
    args.title = title;
    if !redirects.is_empty() {
        // The chain must end at the destination URL
        let mut chain = redirects;
        if chain.last().map(String::as_str) != Some(url) {
            chain.push(url.to_string());
        }
        args.redirects = chain;
    }
    backend.add_page(args);

    println!("Recorded visit to {url}");
    Ok(())
}
