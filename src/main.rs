//! mbxport - pooled mailbox batch exporter

mod cli;
mod config;
mod error;
mod export;
mod logging;
mod mailbox;
mod paths;
mod pool;
mod progress;
mod queue;
mod store;
mod worker;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use std::time::Duration;

use cli::{Cli, Commands};
use config::RunConfig;
use queue::WorkQueue;
use store::{JobStatus, RecordStore};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let level = if cli.quiet {
        tracing::Level::ERROR
    } else {
        match cli.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    logging::init(logging::LogConfig::default().with_level(level).with_env_overrides());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Worker(args) => cmd_worker(&cli, args),
        Commands::Status(args) => cmd_status(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Seed the queue, record a job, and run the worker pool.
fn cmd_run(cli: &Cli, args: &cli::RunArgs) -> Result<()> {
    if args.users.is_empty() && args.user_list.is_none() {
        anyhow::bail!("no users given; pass identifiers or --user-list <FILE>");
    }

    let config = RunConfig {
        pool_size: args.processes.max(1),
        start_date: args.start_date,
        mail_suffix: args.mail_suffix.clone(),
        mail_root: args.mail_root.clone(),
        export_root: args.export_root.clone(),
        db_path: cli.db_path.clone(),
        log_dir: args.log_dir.clone(),
        retry_backoff: Duration::from_secs(args.retry_backoff),
        processing_timeout: Duration::from_secs(args.processing_timeout),
        poll_interval: Duration::from_secs(args.poll_interval),
        ..Default::default()
    };

    let queue = WorkQueue::open(&config.db_path)?;
    let mut seeded = queue.seed(&args.users)?;
    if let Some(list) = &args.user_list {
        seeded += queue.seed_from_file(list)?;
    }
    if queue.is_empty()? {
        anyhow::bail!("work queue is empty; every given identifier was blank");
    }
    if !cli.quiet {
        eprintln!(
            "Queued {} mailboxes across {} workers.",
            seeded, config.pool_size
        );
    }
    drop(queue);

    let store = RecordStore::open(&config.db_path)?;
    let job_id = store.create_job("export", std::process::id())?;

    let mut supervisor = pool::Supervisor::new(config)?;
    match supervisor.run() {
        Ok(()) => {
            store.finish_job(job_id, JobStatus::Done)?;
            if !cli.quiet {
                eprintln!("Export finished.");
                for (status, count) in store.item_counts()? {
                    eprintln!("  {}: {}", status, count);
                }
            }
            Ok(())
        }
        Err(e) => {
            store.finish_job(job_id, JobStatus::Failed)?;
            Err(e.into())
        }
    }
}

/// Hidden worker entry point: loop over the shared queue until it drains.
fn cmd_worker(cli: &Cli, args: &cli::WorkerArgs) -> Result<()> {
    use mailbox::JsonMailStore;
    use worker::MailboxExportFactory;

    let config = RunConfig {
        start_date: args.start_date,
        mail_suffix: args.mail_suffix.clone(),
        mail_root: args.mail_root.clone(),
        export_root: args.export_root.clone(),
        db_path: cli.db_path.clone(),
        retry_backoff: Duration::from_secs(args.retry_backoff),
        ..Default::default()
    };

    let mut queue = WorkQueue::open(&config.db_path)?;
    let mut store = RecordStore::open(&config.db_path)?;
    let mail_store = JsonMailStore::new(config.mail_root.clone());
    let factory = MailboxExportFactory::new(mail_store, config);

    worker::run_worker(&mut queue, &mut store, &factory, &args.slot)?;
    Ok(())
}

/// Show queue items and job records from the state database.
fn cmd_status(cli: &Cli, args: &cli::StatusArgs) -> Result<()> {
    use comfy_table::{
        presets::{ASCII_FULL, UTF8_FULL},
        Cell, Color, ContentArrangement, Table,
    };

    let store = RecordStore::open(&cli.db_path)?;

    let counts = store.item_counts()?;
    if counts.is_empty() {
        println!("No queue items recorded at {:?}", cli.db_path);
    } else {
        let mut table = Table::new();
        table
            .load_preset(if args.ascii { ASCII_FULL } else { UTF8_FULL })
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Status", "Items"]);
        for (status, count) in counts {
            let cell = match status.as_str() {
                "DONE" => Cell::new(&status).fg(Color::Green),
                "FAILED" => Cell::new(&status).fg(Color::Red),
                "PROCESSING" => Cell::new(&status).fg(Color::Yellow),
                _ => Cell::new(&status),
            };
            table.add_row(vec![cell, Cell::new(count)]);
        }
        println!("{table}");
    }

    let jobs = store.list_jobs()?;
    if !jobs.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(if args.ascii { ASCII_FULL } else { UTF8_FULL })
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Job", "Name", "Status", "PID"]);
        for (id, name, status, pid) in jobs {
            let status_cell = match status.as_str() {
                "DONE" => Cell::new(&status).fg(Color::Green),
                "FAILED" => Cell::new(&status).fg(Color::Red),
                "STARTED" => Cell::new(&status).fg(Color::Yellow),
                _ => Cell::new(&status),
            };
            table.add_row(vec![
                Cell::new(id),
                Cell::new(name),
                status_cell,
                Cell::new(pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())),
            ]);
        }
        println!("{table}");
    }

    Ok(())
}
