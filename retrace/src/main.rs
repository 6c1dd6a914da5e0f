use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use retrace::cli::Args;
use retrace::schedule::{Record, Schedule};

fn main() -> Result<ExitCode> {
    env_logger::init();

    let args = Args::parse();

    let schedule = Schedule::from_file(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;

    if !args.quiet {
        println!("schedule: {} ({} records)", args.file.display(), schedule.len());
    }

    if let Some(other_path) = args.diff {
        let other = Schedule::from_file(&other_path)
            .with_context(|| format!("failed to load {}", other_path.display()))?;
        return Ok(diff(&schedule, &other));
    }

    if args.summary {
        summarize(&schedule);
    } else {
        dump(&schedule);
    }
    Ok(ExitCode::SUCCESS)
}

fn dump(schedule: &Schedule) {
    let width = schedule.len().to_string().len();
    for (index, record) in schedule.records.iter().enumerate() {
        println!("{index:>width$}  {}", record.to_line());
    }
}

fn summarize(schedule: &Schedule) {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut per_role: BTreeMap<String, usize> = BTreeMap::new();

    for record in &schedule.records {
        let tag = match record {
            Record::Node { .. } => "node",
            Record::Exec { thread, .. } => {
                *per_role.entry(thread.to_string()).or_default() += 1;
                "exec"
            }
            Record::Mark { .. } => "mark",
            Record::Point { .. } => "point",
        };
        *counts.entry(tag).or_default() += 1;
    }

    for (tag, count) in &counts {
        println!("  {tag:<6} {count}");
    }
    if !per_role.is_empty() {
        println!("executed callbacks by thread role:");
        for (role, count) in &per_role {
            println!("  {role:<6} {count}");
        }
    }
}

/// Print the first position where the two schedules disagree; exit code 1
/// when they differ — the offline counterpart of the divergence detector.
fn diff(left: &Schedule, right: &Schedule) -> ExitCode {
    for (index, (a, b)) in left.records.iter().zip(&right.records).enumerate() {
        if a != b {
            println!("first disagreement at record {index}:");
            println!("  - {}", a.to_line());
            println!("  + {}", b.to_line());
            return ExitCode::FAILURE;
        }
    }
    if left.len() != right.len() {
        let index = left.len().min(right.len());
        println!(
            "schedules agree for {index} records, then lengths differ ({} vs {})",
            left.len(),
            right.len()
        );
        return ExitCode::FAILURE;
    }
    println!("schedules are identical ({} records)", left.len());
    ExitCode::SUCCESS
}
