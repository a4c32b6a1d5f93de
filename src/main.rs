use std::sync::Arc;

use clap::Parser;
use manualdex::{
    DataDir,
    ExpansionTables,
    Manifest,
    QueryNormalizer,
    RetrievalSettings,
    Retriever,
    SearchRequest,
    error,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("MANUALDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let tables =
        Arc::new(ExpansionTables::load_or_empty(cli.expansions.as_deref()));
    let data_dir = || DataDir::resolve(cli.data_dir.as_deref());
    let retriever = |data_dir: &DataDir| {
        Retriever::open(data_dir, tables.clone(), RetrievalSettings::default())
    };

    match &cli.command {
        Command::Search(args) => cmd_search(&retriever(&data_dir()?), args)?,
        Command::Context(args) => {
            cmd_context(&retriever(&data_dir()?), args)?
        }
        Command::Pages(args) => cmd_pages(&retriever(&data_dir()?), args)?,
        Command::Tags(args) => cmd_tags(&retriever(&data_dir()?), args)?,
        Command::Status(args) => {
            let data_dir = data_dir()?;
            cmd_status(&retriever(&data_dir), &data_dir, args)?
        }
        Command::Load(args) => {
            let report =
                Manifest::from_path(&args.manifest)?.load_into(&data_dir()?)?;
            println!(
                "Loaded {} documents, {} pages, {} tags, {} document tags, {} cards",
                report.documents,
                report.pages,
                report.tags,
                report.document_tags,
                report.cards
            );
        }
        Command::Expand(args) => cmd_expand(&tables, args),
        Command::Completions(args) => args.generate(),
    }

    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> error::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_search(retriever: &Retriever, args: &cli::SearchArgs) -> error::Result<()> {
    let mut request = SearchRequest::new(&args.query)
        .limit(args.limit)
        .offset(args.offset)
        .boost_authority(args.authority);
    request.equipment = args.equipment.clone();
    request.doc_class = args.doc_class.clone();
    request.tags = args.tags.clone();

    let outcome = retriever.search_with_cards(&request)?;

    if args.json {
        let cards = if args.cards { outcome.cards.as_slice() } else { &[] };
        return print_json(&serde_json::json!({
            "query": args.query,
            "total": outcome.total,
            "fallback_used": outcome.fallback_used,
            "results": outcome.hits,
            "cards": cards,
        }));
    }

    if outcome.hits.is_empty() {
        println!("No results for '{}'", args.query);
    }
    for (i, hit) in outcome.hits.iter().enumerate() {
        println!(
            "{:>3}. {} p.{} [{} / {}] score {:.3}",
            args.offset + i + 1,
            hit.filename,
            hit.page,
            hit.equipment,
            hit.doc_class,
            hit.score
        );
        if !hit.snippet.is_empty() {
            println!("     {}", hit.snippet);
        }
    }
    if outcome.fallback_used {
        println!("(broadened: too few exact matches)");
    }
    if args.cards && !outcome.cards.is_empty() {
        println!("\nTroubleshooting cards:");
        for card in &outcome.cards {
            println!("  {} - {} ({} p.{})", card.card_id, card.title, card.filename, card.page);
        }
    }
    Ok(())
}

fn cmd_context(retriever: &Retriever, args: &cli::ContextArgs) -> error::Result<()> {
    let passages = retriever.get_context_for_llm(
        &args.query,
        args.equipment.as_deref(),
        args.limit,
    )?;

    if args.json {
        return print_json(&passages);
    }
    for p in &passages {
        println!(
            "--- {} p.{} ({}, {}) ---",
            p.filename, p.page, p.doc_class, p.authority_label
        );
        println!("{}", p.content);
    }
    Ok(())
}

fn cmd_pages(retriever: &Retriever, args: &cli::PagesArgs) -> error::Result<()> {
    let pages = retriever.get_pages_content(&args.document, &args.pages)?;

    if args.json {
        return print_json(&pages);
    }
    if pages.is_empty() {
        eprintln!("No pages found for '{}'", args.document);
    }
    for p in &pages {
        println!("--- {} p.{} ---", p.filename, p.page);
        println!("{}", p.content);
    }
    Ok(())
}

fn cmd_tags(retriever: &Retriever, args: &cli::TagsArgs) -> error::Result<()> {
    let facets = retriever.tag_facets(args.equipment.as_deref())?;

    if args.json {
        return print_json(&facets);
    }
    if facets.is_empty() {
        println!("No tagged documents.");
    }
    for f in &facets {
        println!("{}\t{}\t{}", f.document_count, f.namespace, f.name);
    }
    Ok(())
}

fn cmd_status(
    retriever: &Retriever,
    data_dir: &DataDir,
    args: &cli::StatusArgs,
) -> error::Result<()> {
    let stats = retriever.stats()?;
    let recent = retriever.recent_queries(args.recent)?;

    if args.json {
        return print_json(&serde_json::json!({
            "data_dir": data_dir.root(),
            "available": retriever.is_available(),
            "stats": stats,
            "recent_queries": recent,
        }));
    }

    println!("Data directory: {}", data_dir.root().display());
    if !retriever.is_available() {
        println!("Index: not built");
    }
    println!("Documents: {}", stats.documents);
    println!("Pages: {}", stats.pages);
    println!("Tags: {}", stats.tags);
    println!("Troubleshooting cards: {}", stats.cards);
    println!("Logged queries: {}", stats.logged_queries);
    for (equipment, count) in &stats.equipment {
        println!("  {equipment}: {count} documents");
    }
    if !recent.is_empty() {
        println!("Recent queries:");
        for q in &recent {
            println!("  {} ({} results)", q.query, q.result_count);
        }
    }
    Ok(())
}

fn cmd_expand(tables: &ExpansionTables, args: &cli::ExpandArgs) {
    let n = QueryNormalizer::new(tables);
    let expanded = n.prepare_search_query(&args.query);
    let precise = n.prepare_smart_query(&args.query);
    let broad = n.prepare_broad_query(&args.query);
    let fallback = n.prepare_fallback_query(&args.query);

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "query": args.query,
                "expanded": expanded,
                "precise": precise,
                "broad": broad,
                "fallback": fallback,
            })
        );
    } else {
        println!("expanded: {expanded}");
        println!("precise:  {precise}");
        println!("broad:    {broad}");
        println!("fallback: {fallback}");
    }
}
