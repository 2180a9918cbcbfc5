use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// SQLite database holding the jobs table.
    #[arg(long, default_value = "tbeans.sqlite")]
    pub(crate) db: PathBuf,
    /// YAML file with queue settings.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Tube to use and watch instead of the configured default.
    #[arg(short, long)]
    pub(crate) tube: Option<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Puts a JSON payload on the tube.
    Put {
        body: String,
        /// Seconds before the job can be reserved.
        #[arg(long, default_value_t)]
        delay: u32,
        #[arg(short, long)]
        priority: Option<u32>,
    },
    /// Reserves a job and prints it. It stays reserved.
    Reserve {
        /// Seconds to wait for a job; waits until interrupted if unset.
        #[arg(long)]
        timeout: Option<u64>,
    },
    Peek {
        id: u64,
    },
    PeekReady,
    PeekDelayed,
    PeekBuried,
    Delete {
        id: u64,
    },
    Release {
        id: u64,
        #[arg(short, long)]
        priority: Option<u32>,
        #[arg(long, default_value_t)]
        delay: u32,
    },
    Bury {
        id: u64,
        #[arg(short, long)]
        priority: Option<u32>,
    },
    /// Kicks up to `count` buried jobs.
    Kick {
        #[arg(default_value_t = 1)]
        count: usize,
    },
    KickJob {
        id: u64,
    },
    Stats,
    StatsTube {
        tube: Option<String>,
    },
    StatsJob {
        id: u64,
    },
    ListTubes,
    /// Feeds jobs to a program, one run per job, with the JSON payload on
    /// its stdin. Exit status 0 deletes the job, 75 releases it and
    /// anything else buries it. Options go before `program`; everything
    /// after it is passed to the program.
    Work {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Stop after this many jobs.
        #[arg(long)]
        limit: Option<usize>,
        /// Stop once no job turned up for this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
}
