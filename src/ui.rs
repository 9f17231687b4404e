//! Terminal output: a live progress line and the end-of-run report.
//!
//! Uses `indicatif` for the spinner and `console` for colors. The item count
//! is unknown up front (inputs are discovered lazily), so the bar shows
//! counts rather than a percentage.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::StatusCounts;
use crate::error::FailureKind;
use crate::ledger::LedgerSnapshot;
use crate::orchestrator::RunSummary;

#[derive(Debug, Default)]
struct Counts {
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Live progress for one pool run.
pub struct RunProgress {
    pb: ProgressBar,
    counts: Counts,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    pub fn start(root: &Path) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed_precise}] {pos} done · {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("scanning {}", root.display()));
        pb.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(pb)
    }

    /// No terminal output; used by tests and `--quiet` style embedding.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            counts: Counts::default(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn skipped(&self) {
        self.counts.skipped.fetch_add(1, Ordering::Relaxed);
        self.tick();
    }

    pub fn succeeded(&self, item: &Path, score: f64) {
        self.counts.succeeded.fetch_add(1, Ordering::Relaxed);
        self.pb.set_message(format!(
            "{} {} ({score:.1}) · {}",
            self.green.apply_to("✓"),
            file_name(item),
            self.totals()
        ));
        self.pb.inc(1);
    }

    pub fn failed(&self, item: &Path, reason: &FailureKind) {
        self.counts.failed.fetch_add(1, Ordering::Relaxed);
        self.pb.println(format!(
            "  {} {}: {reason}",
            self.red.apply_to("✗"),
            item.display()
        ));
        self.tick();
    }

    /// Print a retry line: attempt number, limit, and reason.
    pub fn retry(&self, item: &Path, attempt: u32, max: u32, reason: &FailureKind) {
        self.pb.println(format!(
            "  {} Retry {attempt}/{max} {}: {reason}",
            self.yellow.apply_to("↻"),
            file_name(item)
        ));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }

    fn tick(&self) {
        self.pb.set_message(self.totals());
        self.pb.inc(1);
    }

    fn totals(&self) -> String {
        format!(
            "ok {} · failed {} · skipped {}",
            self.counts.succeeded.load(Ordering::Relaxed),
            self.counts.failed.load(Ordering::Relaxed),
            self.counts.skipped.load(Ordering::Relaxed),
        )
    }
}

fn file_name(item: &Path) -> String {
    item.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| item.display().to_string())
}

/// Final run report: outcome counts, throughput and cost breakdown.
pub fn print_summary(summary: &RunSummary, cost: &LedgerSnapshot, elapsed: Duration) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let cyan = Style::new().cyan().bold();
    let secs = elapsed.as_secs_f64();

    println!();
    if summary.interrupted {
        println!("{}", red.apply_to("Run interrupted; finished items are saved."));
    } else {
        println!("{}", green.apply_to("Batch processing completed."));
    }
    println!("  Submitted:  {}", summary.submitted);
    println!("  Succeeded:  {}", summary.succeeded);
    println!("  Failed:     {}", summary.failed);
    println!("  Skipped:    {}", summary.skipped);
    if summary.abandoned > 0 {
        println!("  Abandoned:  {}", summary.abandoned);
    }
    if summary.unrecorded > 0 || summary.panicked > 0 {
        println!(
            "  {} {} unrecorded, {} crashed",
            red.apply_to("!"),
            summary.unrecorded,
            summary.panicked
        );
    }
    println!("  Peak in-flight: {}", summary.peak_in_flight);
    println!("  Time: {secs:.1}s");
    if secs > 0.0 && summary.submitted > 0 {
        println!("  Speed: {:.2} images/sec", summary.submitted as f64 / secs);
    }

    println!();
    println!("{}", cyan.apply_to("Cost Analysis"));
    println!("  Input tokens:        {}", cost.prompt_tokens);
    println!("  Output tokens:       {}", cost.completion_tokens);
    if cost.reasoning_tokens > 0 {
        println!("  Reasoning tokens:    {}", cost.reasoning_tokens);
    }
    println!("  Total output tokens: {}", cost.total_output_tokens());
    println!("  Input cost:  {:.4}", cost.input_cost);
    println!("  Output cost: {:.4}", cost.output_cost);
    println!("  Total cost:  {:.4}", cost.total_cost);
    if summary.succeeded > 0 {
        println!(
            "  Cost per image: {:.4}",
            cost.total_cost / summary.succeeded as f64
        );
    }
    println!(
        "  Requests: {} succeeded / {} total",
        cost.succeeded_requests,
        cost.total_requests()
    );
}

/// Report for `vlm-batch status`.
pub fn print_status(root: &Path, counts: &StatusCounts) {
    let total = counts.total();
    let done = counts.succeeded + counts.failed;
    let pct = if total > 0 {
        done as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    println!("{}", Style::new().cyan().bold().apply_to("Checkpoint status"));
    println!("  Directory: {}", root.display());
    println!(
        "  {} Succeeded: {}",
        Style::new().green().apply_to("✓"),
        counts.succeeded
    );
    println!(
        "  {} Failed:    {}",
        Style::new().red().apply_to("✗"),
        counts.failed
    );
    println!("  · Pending:   {}", counts.pending);
    println!("  Progress: {pct:.1}% ({done}/{total})");
}
