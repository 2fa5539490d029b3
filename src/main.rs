//! pgplayback: replay PostgreSQL logs against a live database

use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgplayback::config::{Cli, Command, FilterArgs, InputFormat, RunArgs};
use pgplayback::parse::{parse_csvlog, parse_errlog, parse_json, ParserHandle};
use pgplayback::{
    telemetry, Dispatcher, Item, PlaybackError, Result, Shutdown, Streamer,
};

/// Exit status for unrecoverable replay failures.
const EXIT_REPLAY_FAILED: u8 = 255;

/// Write buffer for the filter output; filtering throughput is dominated
/// by output I/O.
const OUTPUT_BUFFER_SIZE: usize = 32 * 1024 * 1024;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli)) {
        Ok(code) => code,
        Err(err @ PlaybackError::Config(_)) => {
            error!(error = %err, "invalid configuration");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "replay failed");
            ExitCode::from(EXIT_REPLAY_FAILED)
        }
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "pgplayback=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let shutdown = Shutdown::new();

    // Ctrl-C starts a bounded-time drain of every session.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, draining sessions");
                shutdown.request();
            }
        });
    }

    let metrics_handle = telemetry::install();
    {
        let shutdown = shutdown.clone();
        let address = cli.metrics_address.clone();
        let port = cli.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = telemetry::serve(&address, port, metrics_handle, shutdown).await {
                warn!(error = %err, "metrics listener failed");
            }
        });
    }

    let streamer = Streamer::new(cli.start, cli.finish, shutdown.clone());

    let result = match cli.command {
        Command::Filter(args) => run_filter(args, &streamer)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Run(args) => run_replay(args, &streamer, shutdown.clone()).await,
    };

    // Stops the metrics listener.
    shutdown.request();
    result
}

fn open_parser(format: InputFormat) -> Result<ParserHandle> {
    Ok(match format {
        InputFormat::Errlog(path) => parse_errlog(File::open(path)?),
        InputFormat::Csvlog(path) => parse_csvlog(File::open(path)?),
        InputFormat::Json(path) => parse_json(File::open(path)?),
    })
}

/// Split a parser handle into its item stream, logging diagnostics as they
/// arrive and surfacing the terminal parse result through a join handle.
fn watch_parser(handle: ParserHandle) -> (mpsc::Receiver<Item>, JoinHandle<Result<()>>) {
    let ParserHandle {
        items,
        mut errors,
        done,
    } = handle;

    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            debug!(error = %err, "parse error");
        }
    });

    let done_task = tokio::spawn(async move {
        let result = done.await.unwrap_or(Ok(()));
        match &result {
            Ok(()) => info!("parse finished"),
            Err(err) => error!(error = %err, "parse failed"),
        }
        result
    });

    (items, done_task)
}

async fn run_filter(args: FilterArgs, streamer: &Streamer) -> Result<()> {
    let (items, parse_done) = watch_parser(open_parser(args.input.resolve()?)?);
    let mut filtered = streamer.filter(items);

    if args.null_output {
        info!("null output enabled, items will not be serialized");
        while filtered.recv().await.is_some() {}
    } else {
        let path = args.output.ok_or_else(|| {
            PlaybackError::Config("must provide --output when --null-output is not set".to_string())
        })?;
        let file = File::create(&path)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, file);
            while let Some(item) = filtered.blocking_recv() {
                serde_json::to_writer(&mut writer, &item)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|err| PlaybackError::Io(std::io::Error::other(err)))??;

        info!(output = %path.display(), "filter finished");
    }

    parse_done.await.unwrap_or(Ok(()))
}

async fn run_replay(args: RunArgs, streamer: &Streamer, shutdown: Shutdown) -> Result<ExitCode> {
    let dispatcher = match Dispatcher::connect(args.replay_config(), shutdown).await {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            error!(error = %err, "postgres connection failed");
            return Ok(ExitCode::from(EXIT_REPLAY_FAILED));
        }
    };

    let (items, parse_done) = watch_parser(open_parser(args.input.resolve()?)?);
    let stream = streamer.stream(items, args.replay_rate)?;
    let (mut errors, consume_done) = dispatcher.consume(stream);

    let errors_task = tokio::spawn(async move {
        let mut count: u64 = 0;
        while let Some(err) = errors.recv().await {
            count += 1;
            warn!(error = %err, "replay error");
        }
        count
    });

    let _ = consume_done.await;
    let replay_errors = errors_task.await.unwrap_or(0);

    match parse_done.await.unwrap_or(Ok(())) {
        Ok(()) => {
            info!(replay_errors, "replay finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(error = %err, "input processing failed");
            Ok(ExitCode::from(EXIT_REPLAY_FAILED))
        }
    }
}
