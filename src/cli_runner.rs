//! Dispatches parsed CLI commands to the library and renders progress.

use crate::cli::Commands;
use crate::compress;
use crate::error::Result;
use crate::fsx;
use crate::package::{BuildOptions, PackageAssembler};
use crate::progress::ProgressState;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::info;

/// Runs one parsed command.
pub fn run_command(command: &Commands) -> Result<()> {
    match command {
        Commands::Build {
            build_root,
            deb,
            gzip,
            archiver,
            ar_program,
            remove_control_dir,
            keep_owner,
            verify,
            progress,
        } => {
            let opts = BuildOptions {
                gzip: gzip.to_options(),
                remove_control_dir: *remove_control_dir,
                verify: *verify,
                root_owner: !*keep_owner,
                archiver: *archiver,
                ar_program: ar_program.clone(),
                ..BuildOptions::default()
            };

            let mut assembler = PackageAssembler::from_options(&opts);
            if *progress {
                assembler = assembler.with_progress(Arc::new(create_cli_progress_callback("build")));
            }

            assembler.build(build_root, deb, &opts)?;
        }
        Commands::Gzip { file, gzip, discard } => {
            let gz_path = compress::compress_file(file, &gzip.to_options())?;
            if *discard {
                fsx::remove_file_if_exists(&gz_path)?;
                info!(path = %gz_path.display(), "Discarded compressed output");
            }
        }
    }

    Ok(())
}

// --- utils for CLI progress -------------------------------------------------

fn create_cli_progress_callback(operation: &str) -> impl Fn(ProgressState) + Send + Sync + 'static {
    let operation = operation.to_string();
    let last_update = Mutex::new(Instant::now());
    let prev_len = Mutex::new(0usize);
    let done = AtomicBool::new(false);

    move |state: ProgressState| {
        if done.load(Ordering::Relaxed) {
            return;
        }
        let percent = state.progress_percent();
        let finished = state.stage == crate::progress::BuildStage::Publish;
        // Update every 100ms to avoid terminal spam, but always show the last state
        let should_update = finished || {
            let Ok(mut last) = last_update.lock() else { return };
            if last.elapsed().as_millis() >= 100 {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !should_update {
            return;
        }

        // Determine terminal width (default 80)
        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);

        let build_status_line = |bw: usize| -> String {
            let filled = ((percent / 100.0) * bw as f32) as usize;
            let empty = bw.saturating_sub(filled);
            format!(
                "[{}] {:<15} [{}{}] {:.1}% | {}/{} blocks | {:.1} MB/s",
                operation.to_uppercase(),
                state.stage.to_string(),
                "#".repeat(filled),
                "-".repeat(empty),
                percent,
                state.completed_blocks,
                state.total_blocks,
                state.speed_mbps(),
            )
        };

        let mut bar_len: usize = 30;
        let status_line = loop {
            let line = build_status_line(bar_len);
            if line.len() <= term_width || bar_len <= 10 {
                break line;
            }
            bar_len -= 4;
        };

        // Print to stderr to avoid interfering with stdout
        let mut line_to_print = status_line;
        if let Ok(mut prev) = prev_len.lock() {
            if *prev > line_to_print.len() {
                let diff = *prev - line_to_print.len();
                line_to_print.push_str(&" ".repeat(diff));
            }
            *prev = line_to_print.len();
        }
        eprint!("\r{}", line_to_print);
        io::stderr().flush().ok();

        if finished {
            eprintln!();
            done.store(true, Ordering::Relaxed);
        }
    }
}
