use anyhow::Result;

use crate::config::QuarryConfig;
use crate::rag::types::IterativeRagResult;
use crate::rag::IterativeSearchArgs;
use crate::server::build_services;

pub struct AskOptions {
    pub agent: Option<String>,
    pub max_iterations: Option<usize>,
    pub web: bool,
    pub planning: bool,
    pub json: bool,
}

/// Run one iterative search from the terminal.
pub async fn ask(config: QuarryConfig, query: &str, opts: AskOptions) -> Result<()> {
    let services = build_services(config)?;
    let config = &services.config;

    let agent = opts
        .agent
        .unwrap_or_else(|| config.storage.default_agent.clone());
    let indexed = services.store.count(&agent).await?;
    if indexed == 0 {
        eprintln!("Agent '{agent}' has no indexed context. Run `quarry ingest <paths>` first.");
    }

    let mut args = IterativeSearchArgs::from_config(agent, query, config);
    if let Some(n) = opts.max_iterations {
        args.max_iterations = n;
    }
    args.features.web_search |= opts.web;
    args.features.agentic_planning |= opts.planning;

    let result = services.orchestrator.perform_iterative_search(args).await;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

fn print_result(result: &IterativeRagResult) {
    println!("{}\n", result.final_answer.trim());

    if !result.citations.is_empty() {
        println!("Sources:");
        for c in &result.citations {
            match c.line_range {
                Some(r) => println!("  [{}] {} (lines {}-{})", c.id, c.title, r.start, r.end),
                None => println!("  [{}] {}", c.id, c.title),
            }
        }
        println!();
    }
    for w in &result.web_search_sources {
        println!("  [web] {} <{}>", w.title, w.url);
    }

    let m = &result.search_metrics;
    println!(
        "{} iteration(s), {} context item(s), quality {:.2}, citation accuracy {:.2}",
        m.total_iterations,
        result.accumulated_context.len(),
        m.quality_score,
        m.citation_accuracy,
    );
    println!("Stopped: {}", m.termination_reason);
}
