//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "retrace",
    about = "Inspect and compare recorded event-loop schedules",
    after_help = "\
EXAMPLES:
    retrace sched.txt                   Dump a schedule, record by record
    retrace sched.txt --summary         Per-kind record counts
    retrace sched.txt --diff sched.txt-replay
                                        First position where two schedules disagree"
)]
pub struct Args {
    /// Schedule file to inspect
    pub file: PathBuf,

    /// Print record counts instead of the full dump
    #[arg(long, conflicts_with = "diff")]
    pub summary: bool,

    /// Compare against a second schedule file
    #[arg(long, value_name = "FILE")]
    pub diff: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
