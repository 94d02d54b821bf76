use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::{
    progress::Event,
    supervisor::{StageId, STAGE_COUNT},
};

// ── Terminal helpers ──────────────────────────────────────────────────────────

fn term_width() -> usize {
    Term::stdout().size().1.max(60) as usize
}

fn rule() -> String {
    "─".repeat(term_width().min(52))
}

// ── Banner ────────────────────────────────────────────────────────────────────

pub fn print_banner() {
    let logo = [
        r"    ██████╗ ███╗   ██╗ ██╗ ██████╗ ███████╗",
        r"   ██╔═══██╗████╗  ██║███║██╔═══██╗██╔════╝",
        r"   ██║   ██║██╔██╗ ██║╚██║██║   ██║███████╗",
        r"   ██║   ██║██║╚██╗██║ ██║██║   ██║╚════██║",
        r"   ╚██████╔╝██║ ╚████║ ██║╚██████╔╝███████║",
        r"    ╚═════╝ ╚═╝  ╚═══╝ ╚═╝ ╚═════╝ ╚══════╝",
    ];

    println!();
    for line in &logo {
        println!("{}", style(line).cyan().bold());
    }
    println!();
    println!(
        "{}",
        style(format!(
            "   Installation Engine  ·  v{}",
            env!("CARGO_PKG_VERSION")
        ))
        .dim()
        .italic()
    );
    println!();
    println!("{}", style(rule()).dim());
    println!();
}

// ── Step header ───────────────────────────────────────────────────────────────

/// Prints a visually distinct numbered stage header.
pub fn print_step(step: u8, total: u8, title: &str) {
    println!();
    let tag = style(format!(" {}/{} ", step, total)).black().on_cyan().bold();
    let heading = style(format!("  {}", title)).white().bold();
    println!("{}{}", tag, heading);
    println!("{}", style(rule()).dim());
}

// ── Feedback messages ─────────────────────────────────────────────────────────

/// Green ✓
pub fn print_success(msg: &str) {
    println!("  {}  {}", style("✓").green().bold(), style(msg).green());
}

/// Blue →
pub fn print_info(msg: &str) {
    println!("  {}  {}", style("→").blue().bold(), msg);
}

/// Yellow ⚠
pub fn print_warning(msg: &str) {
    println!("  {}  {}", style("⚠").yellow().bold(), style(msg).yellow());
}

/// Red ✗, written to stderr.
pub fn print_error(msg: &str) {
    eprintln!("  {}  {}", style("✗").red().bold(), style(msg).red());
}

// ── Info box ──────────────────────────────────────────────────────────────────

/// Renders a bordered key→value box in the terminal.
///
/// ```text
/// ┌─ Installation Plan ───────────────┐
/// │  Disk         /dev/sda             │
/// │  Filesystem   ext4                 │
/// └───────────────────────────────────┘
/// ```
pub fn print_kv_box(title: &str, rows: &[(&str, String)]) {
    const BOX_INNER: usize = 38;

    let dashes = "─".repeat(BOX_INNER.saturating_sub(title.chars().count() + 2));
    println!(
        "  ┌─ {} {}┐",
        style(title).white().bold(),
        style(&dashes).dim()
    );

    for (key, val) in rows {
        println!(
            "  │  {:<13}{}",
            style(*key).dim(),
            style(val).white().bold()
        );
    }

    println!("  └{}┘", style("─".repeat(BOX_INNER + 2)).dim());
}

// ── Spinner / bar ─────────────────────────────────────────────────────────────

/// Returns a running braille spinner.
pub fn spinner(msg: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(st) = ProgressStyle::with_template("  {spinner:.cyan.bold}  {msg}") {
        pb.set_style(st.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.into());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn copy_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    if let Ok(st) = ProgressStyle::with_template(
        "  {spinner:.cyan.bold}  [{bar:32.cyan/blue}] {pos:>3}%  {msg}",
    ) {
        pb.set_style(st.progress_chars("█▓░"));
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

// ── Event renderer ────────────────────────────────────────────────────────────

/// Turns the status stream of a run into terminal output.
///
/// In plain mode each event is one line on stdout, suitable for logs and
/// for a front end reading the installer's output. Otherwise stages get a
/// header, steps a spinner and the copy a progress bar.
pub struct Renderer {
    plain: bool,
    active: Option<(ProgressBar, String)>,
}

impl Renderer {
    pub fn new(plain: bool) -> Self {
        Self {
            plain,
            active: None,
        }
    }

    pub fn render(&mut self, event: &Event) {
        if self.plain {
            println!("{}", event);
            return;
        }

        match event {
            Event::StageStarted { stage, description } => {
                self.settle();
                print_step(stage.ordinal(), STAGE_COUNT, stage.title());
                self.start(spinner(description.clone()), description);
            }
            Event::Step { description, .. } => {
                self.settle();
                self.start(spinner(description.clone()), description);
            }
            Event::Progress {
                percent,
                files_done,
                files_total,
                ..
            } => self.progress(*percent, *files_done, *files_total),
            Event::Completed => {
                self.settle();
                println!();
                print_success("Installation completed successfully.");
                print_info("Remove the installation medium and reboot.");
            }
            Event::Failed { stage, cause } => {
                if let Some((pb, _)) = self.active.take() {
                    pb.abandon();
                }
                println!();
                print_error(&format!("{} failed", stage_label(*stage)));
                for line in cause.lines() {
                    print_error(line);
                }
            }
        }
    }

    fn start(&mut self, pb: ProgressBar, msg: &str) {
        self.active = Some((pb, msg.to_string()));
    }

    /// Marks the running step as done.
    fn settle(&mut self) {
        if let Some((pb, msg)) = self.active.take() {
            pb.finish_and_clear();
            print_success(&msg);
        }
    }

    fn progress(&mut self, percent: u8, files_done: u64, files_total: u64) {
        let is_bar = matches!(self.active, Some((ref pb, _)) if pb.length() == Some(100));
        if !is_bar {
            let msg = self
                .active
                .take()
                .map(|(pb, msg)| {
                    pb.finish_and_clear();
                    msg
                })
                .unwrap_or_else(|| "Copying files".to_string());
            self.start(copy_bar(), &msg);
        }
        if let Some((ref pb, _)) = self.active {
            pb.set_position(u64::from(percent));
            if files_total > 0 {
                pb.set_message(format!("{}/{} files", files_done, files_total));
            }
        }
    }

    /// Leaves the terminal tidy if the stream ended without a terminal event.
    pub fn finish(&mut self) {
        if let Some((pb, _)) = self.active.take() {
            pb.abandon();
        }
    }
}

fn stage_label(stage: StageId) -> String {
    format!("Stage {}/{} ({})", stage.ordinal(), STAGE_COUNT, stage.title())
}
