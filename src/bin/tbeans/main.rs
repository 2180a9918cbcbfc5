mod args;

use std::io::{self, Write};
use std::process::{self, ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use table_beans::store::SqliteStore;
use table_beans::types::stats::JobStats;
use table_beans::{
    Job, ProcessOptions, PutOptions, Queue, QueueConfig, Verdict,
};
use tokio::{signal, task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Level};

use crate::args::{Args, Command};

/// Exit status a `work` program uses to hand its job back (EX_TEMPFAIL).
const EXIT_RELEASE: i32 = 75;

type SqliteQueue = Queue<SqliteStore>;

#[derive(Serialize)]
struct JobView {
    #[serde(flatten)]
    stats: JobStats,
    body: Value,
}

impl JobView {
    fn of(job: &Job<SqliteStore>) -> Result<Self> {
        Ok(Self {
            stats: job.stats()?,
            body: job.body()?,
        })
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging goes to stderr; stdout carries the YAML output.
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_writer(io::stderr)
            .init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = run(args, cancel).await {
        error!(error = format!("{error:#}"), "command failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(args: Args, cancel: CancellationToken) -> Result<()> {
    let config = match &args.config {
        Some(path) => QueueConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => QueueConfig::default(),
    };
    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("opening {}", args.db.display()))?;

    let mut queue = Queue::with_config(Arc::new(store), config);
    if let Some(tube) = args.tube {
        queue.choose(tube.clone()).watch([tube], true);
    }

    match args.command {
        Command::Put {
            body,
            delay,
            priority,
        } => {
            let body: Value =
                serde_json::from_str(&body).context("payload must be JSON")?;
            let id = queue.put(&body, PutOptions { delay, priority })?;
            emit(&Id { id })
        },
        Command::Reserve { timeout } => {
            let timeout = timeout.map(Duration::from_secs);
            let poll_interval = queue.config().poll_interval();
            let job = queue
                .reserve_with(timeout, poll_interval, Some(&cancel))
                .await?;
            emit_job(job.as_ref())
        },
        Command::Peek { id } => emit_job(queue.peek(id)?.as_ref()),
        Command::PeekReady => emit_job(queue.peek_ready()?.as_ref()),
        Command::PeekDelayed => emit_job(queue.peek_delayed()?.as_ref()),
        Command::PeekBuried => emit_job(queue.peek_buried()?.as_ref()),
        Command::Delete { id } => {
            let done = find(&queue, id)?.delete()?;
            emit(&Done { done })
        },
        Command::Release {
            id,
            priority,
            delay,
        } => {
            let done = find(&queue, id)?.release(priority, delay)?;
            emit(&Done { done })
        },
        Command::Bury { id, priority } => {
            let done = find(&queue, id)?.bury(priority)?;
            emit(&Done { done })
        },
        Command::Kick { count } => {
            let kicked = queue.kick(count)?;
            emit(&Kicked { kicked })
        },
        Command::KickJob { id } => {
            let done = find(&queue, id)?.kick()?;
            emit(&Done { done })
        },
        Command::Stats => emit(&queue.stats(None)?),
        Command::StatsTube { tube } => {
            emit(&queue.stats_tube(tube.as_deref())?)
        },
        Command::StatsJob { id } => emit(&find(&queue, id)?.stats()?),
        Command::ListTubes => emit(&queue.list_tubes()?),
        Command::Work {
            program,
            args,
            limit,
            timeout,
        } => {
            let options = ProcessOptions {
                limit,
                timeout: timeout.map(Duration::from_secs),
                cancel: Some(cancel),
                ..Default::default()
            };
            let stats = queue
                .process(
                    |body: Value, job: &Job<SqliteStore>| {
                        work_on(&program, &args, &body, job.id())
                    },
                    options,
                )
                .await?;
            emit(&stats)
        },
    }
}

#[derive(Serialize)]
struct Id {
    id: u64,
}

#[derive(Serialize)]
struct Done {
    done: bool,
}

#[derive(Serialize)]
struct Kicked {
    kicked: usize,
}

fn find(queue: &SqliteQueue, id: u64) -> Result<Job<SqliteStore>> {
    queue.peek(id)?.ok_or_else(|| anyhow!("no job with id {id}"))
}

fn emit<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value).context("rendering output")?;
    io::stdout()
        .write_all(yaml.as_bytes())
        .context("writing output")
}

fn emit_job(job: Option<&Job<SqliteStore>>) -> Result<()> {
    match job {
        Some(job) => emit(&JobView::of(job)?),
        None => emit(&Value::Null),
    }
}

/// Runs `run_program` on this worker thread while the runtime's other tasks,
/// ctrl-c handling included, move to the remaining workers.
fn work_on(
    program: &str,
    args: &[String],
    body: &Value,
    id: u64,
) -> Result<Verdict> {
    task::block_in_place(|| run_program(program, args, body, id))
}

/// Runs one `work` program for job `id`, returning what to do with the job.
fn run_program(
    program: &str,
    args: &[String],
    body: &Value,
    id: u64,
) -> Result<Verdict> {
    let mut child = process::Command::new(program)
        .args(args)
        .env("TBEANS_JOB_ID", id.to_string())
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(error) = serde_json::to_writer(&mut stdin, body) {
            warn!(id, %error, "program didn't take its input");
        }
    }

    let status = child.wait().with_context(|| format!("waiting on {program}"))?;
    debug!(id, %status, "program exited");

    Ok(match status.code() {
        Some(0) => Verdict::Delete,
        Some(EXIT_RELEASE) => Verdict::Release,
        _ => Verdict::Bury,
    })
}
