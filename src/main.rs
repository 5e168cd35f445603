use std::io::{BufRead, Write};

use clap::Parser;
use docvault::{
    CancelToken,
    ConfigDb,
    DataDir,
    Error,
    IndexBuilder,
    LoaderPool,
    ModelManager,
    QueryEngine,
    Result,
    Settings,
    data_dir::validate_collection_name,
    loader_pool::{BatchRunner, ProcessRunner, ThreadRunner},
    model_manager::resolve_model_id,
    query,
    settings,
    worker,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{BuildArgs, Cli, Command, QueryArgs, ReplArgs, SettingsAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCVAULT_LOG") {
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match &cli.command {
        Command::LoadBatch => return worker::serve_stdio(),
        Command::Completions(args) => {
            args.generate();
            return Ok(());
        }
        _ => {}
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    let mut settings = Settings::load(&config_db)?;
    settings.embedding_model =
        resolve_model_id(cli.model.as_deref(), &settings.embedding_model);

    match cli.command {
        Command::Build(args) => {
            apply_overrides(&mut settings, &args.overrides())?;
            cmd_build(&data_dir, &config_db, &settings, &args)?;
        }
        Command::Query(args) => {
            apply_overrides(&mut settings, &args.options.overrides())?;
            cmd_query(&data_dir, &settings, &args)?;
        }
        Command::Repl(args) => {
            apply_overrides(&mut settings, &args.options.overrides())?;
            cmd_repl(&data_dir, &settings, &args)?;
        }
        Command::List { json } => cmd_list(&config_db, json)?,
        Command::Remove { name } => {
            IndexBuilder::new(&data_dir, &config_db, &settings).remove(&name)?;
            println!("Removed collection '{name}'");
        }
        Command::Status { json } => {
            cmd_status(&config_db, &data_dir, &settings, json)?
        }
        Command::Settings { action } => {
            cmd_settings(&config_db, &settings, action)?
        }
        Command::Completions(_) | Command::LoadBatch => {}
    }

    Ok(())
}

fn apply_overrides(
    settings: &mut Settings,
    overrides: &[(&'static str, String)],
) -> Result<()> {
    for (key, value) in overrides {
        settings.apply(key, value)?;
    }
    settings.validate()
}

fn cmd_build(
    data_dir: &DataDir,
    config_db: &ConfigDb,
    settings: &Settings,
    args: &BuildArgs,
) -> Result<()> {
    validate_collection_name(&args.name)?;
    if !args.source.is_dir() {
        return Err(Error::Config(format!(
            "not a directory: {}",
            args.source.display()
        )));
    }

    let runner: Box<dyn BatchRunner> = if args.in_process {
        Box::new(ThreadRunner)
    } else {
        Box::new(ProcessRunner::current_exe()?)
    };
    let pool = LoaderPool::new(settings, runner);
    let mut model = ModelManager::with_model_id(
        &settings.embedding_model,
        settings.compute_device_build,
    )
    .with_cache_dir(data_dir.models_dir()?);

    let builder = IndexBuilder::new(data_dir, config_db, settings);
    let (report, summary) = builder.build_from_directory(
        &args.name,
        &args.source,
        &pool,
        &mut model,
        &CancelToken::new(),
    )?;

    for failure in &report.failures {
        eprintln!("Skipped {}: {}", failure.path.display(), failure.reason);
    }
    for batch in &report.failed_batches {
        eprintln!(
            "Batch {} ({} files) failed: {}",
            batch.batch_index,
            batch.files.len(),
            batch.reason
        );
    }
    if !report.duplicates.is_empty() {
        eprintln!("{} duplicate file(s) skipped", report.duplicates.len());
    }

    println!(
        "Built '{}': {} document(s), {} chunk(s), dimension {}, model {} ({:.1}s)",
        summary.collection,
        summary.documents,
        summary.chunks,
        summary.dimension,
        summary.model_id,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

fn cmd_query(
    data_dir: &DataDir,
    settings: &Settings,
    args: &QueryArgs,
) -> Result<()> {
    let mut engine = QueryEngine::new(data_dir, settings);
    let results = engine.query(&args.name, &args.query)?;

    if args.json {
        println!("{}", query::format_json(&args.query, &results)?);
    } else if args.citations {
        println!("{}", query::format_citations(&results));
    } else if results.is_empty() {
        println!("No results found.");
    } else {
        print!("{}", query::format_contexts(&results));
    }
    Ok(())
}

fn cmd_repl(
    data_dir: &DataDir,
    settings: &Settings,
    args: &ReplArgs,
) -> Result<()> {
    let mut engine = QueryEngine::new(data_dir, settings);
    let mut collection = args.name.clone();
    engine.switch_to(&collection)?;
    eprintln!("Searching '{collection}'. `:use NAME` switches, `:quit` exits.");

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        eprint!("{collection}> ");
        std::io::stderr().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();

        match input {
            "" => continue,
            ":q" | ":quit" | "exit" => break,
            _ => {}
        }

        if let Some(name) = input.strip_prefix(":use ") {
            match engine.switch_to(name.trim()) {
                Ok(()) => collection = name.trim().to_string(),
                Err(e) => eprintln!("Error: {e}"),
            }
            continue;
        }

        match engine.query(&collection, input) {
            Ok(results) if results.is_empty() => println!("No results found."),
            Ok(results) => {
                print!("{}", query::format_contexts(&results));
                println!("Sources:\n{}", query::format_citations(&results));
            }
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    engine.release();
    Ok(())
}

fn cmd_list(config_db: &ConfigDb, json: bool) -> Result<()> {
    let collections = config_db.list_collections()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&collections)?);
    } else if collections.is_empty() {
        println!("No collections built.");
    } else {
        for c in &collections {
            println!(
                "{}\t{} records\t{}\t{}",
                c.name,
                c.record_count,
                c.model_id,
                c.built_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}

fn cmd_status(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    settings: &Settings,
    json: bool,
) -> Result<()> {
    let collections = config_db.list_collections()?;
    let records: usize = collections.iter().map(|c| c.record_count).sum();
    let documents: usize = collections.iter().map(|c| c.document_count).sum();

    if json {
        let status = serde_json::json!({
            "data_dir": data_dir.root(),
            "model": settings.embedding_model,
            "build_device": settings.compute_device_build.to_string(),
            "query_device": settings.compute_device_query.to_string(),
            "collections": collections.len(),
            "documents": documents,
            "records": records,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Model: {}", settings.embedding_model);
        println!(
            "Devices: build {}, query {}",
            settings.compute_device_build, settings.compute_device_query
        );
        println!("Collections: {}", collections.len());
        for c in &collections {
            println!(
                "  {}: {} documents, {} records ({})",
                c.name, c.document_count, c.record_count, c.model_id
            );
        }
        println!("Documents: {documents}");
        println!("Records: {records}");
    }
    Ok(())
}

fn cmd_settings(
    config_db: &ConfigDb,
    settings: &Settings,
    action: SettingsAction,
) -> Result<()> {
    match action {
        SettingsAction::Show { json } => {
            let entries = settings.entries();
            if json {
                let map: serde_json::Map<String, serde_json::Value> = entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (key, value) in entries {
                    println!("{key} = {value}");
                }
            }
        }
        SettingsAction::Set { key, value } => {
            let mut updated = Settings::load(config_db)?;
            updated.apply(&key, &value)?;
            updated.validate()?;
            config_db.set_setting(&key, &value)?;
            println!("Set {key} = {value}");
        }
        SettingsAction::Clear { key: Some(key) } => {
            if !settings::KEYS.iter().any(|(k, _)| *k == key) {
                return Err(Error::Config(format!("unknown setting '{key}'")));
            }
            if !config_db.remove_setting(&key)? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
            println!("Cleared {key}");
        }
        SettingsAction::Clear { key: None } => {
            for (key, _) in config_db.list_settings()? {
                config_db.remove_setting(&key)?;
            }
            println!("Cleared all settings");
        }
    }
    Ok(())
}
