//! `belay sync`.

use std::path::PathBuf;

use anyhow::Result;
use belay::sync::DEFAULT_IGNORE;
use belay::{KeepPolicy, SyncEvent, SyncOptions};
use clap::Args;

use crate::ConnArgs;

#[derive(Args)]
pub(crate) struct SyncArgs {
    #[command(flatten)]
    conn: ConnArgs,

    /// Local folder or single file.
    folder: PathBuf,

    /// Destination directory on the device.
    #[arg(long, default_value = "/")]
    dst: String,

    /// Remote paths (relative to the destination) never deleted. Replaces
    /// the defaults.
    #[arg(long, value_name = "PATH")]
    keep: Vec<String>,

    /// Never delete anything on the device.
    #[arg(long, conflicts_with = "keep")]
    keep_all: bool,

    /// Extra glob patterns to skip.
    #[arg(long, value_name = "GLOB")]
    ignore: Vec<String>,

    /// Upload Python sources verbatim.
    #[arg(long)]
    no_minify: bool,
}

pub(crate) fn run(args: &SyncArgs) -> Result<()> {
    let device = args.conn.connect(|c| c.with_sync_time(false))?;

    let mut ignore: Vec<String> = DEFAULT_IGNORE.iter().map(|&p| p.to_owned()).collect();
    ignore.extend(args.ignore.iter().cloned());
    let mut opts = SyncOptions::default().with_dst(&args.dst).with_ignore(ignore);
    if args.keep_all {
        opts = opts.with_keep(KeepPolicy::All);
    } else if !args.keep.is_empty() {
        opts = opts.with_keep(KeepPolicy::Paths(args.keep.clone()));
    }
    if args.no_minify {
        opts = opts.with_minifier(None);
    }

    let report = device.sync_with_progress(&args.folder, &opts, |event| match event {
        SyncEvent::Uploading { path, index, total } => eprintln!("[{}/{total}] {path}", index + 1),
        SyncEvent::Deleted(n) if *n > 0 => eprintln!("removed {n} stale path(s)"),
        _ => {}
    })?;
    device.close()?;

    println!(
        "{} uploaded, {} unchanged, {} deleted",
        report.plan.uploads.len(),
        report.unchanged,
        report.plan.deletions().count()
    );
    Ok(())
}
