use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use converter::{config::ConverterConfig, controller::account_output_dir, ledger::{Account, QuotaLedger}, workspace};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::System;
use humansize::{format_size, DECIMAL};

/// How often the ledger and directories are re-read
const RELOAD_EVERY: Duration = Duration::from_secs(1);

/// Per-account directory counts next to the ledger record
#[derive(Debug, Default, Clone, PartialEq)]
struct AccountFiles {
    waiting: usize,
    refused: usize,
    reels: usize,
    reel_bytes: u64,
}

struct AccountRow {
    account: Account,
    files: AccountFiles,
}

struct App {
    rows: Vec<AccountRow>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    cfg: ConverterConfig,
    temp_entries: usize,
    ledger_error: Option<String>,
}

impl App {
    fn new(cfg: ConverterConfig) -> Self {
        Self {
            rows: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            cfg,
            temp_entries: 0,
            ledger_error: None,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.temp_entries = workspace::count_temp_entries(&self.cfg.temp_dir);

        match QuotaLedger::load(&self.cfg.ledger_path) {
            Ok(ledger) => {
                self.ledger_error = None;
                self.rows = ledger
                    .accounts()
                    .map(|account| AccountRow {
                        files: account_files(&self.cfg.inbox_dir, &self.cfg.output_dir, &account.id),
                        account: account.clone(),
                    })
                    .collect();
                // Most recently active first
                self.rows.sort_by(|a, b| b.account.last_activity.cmp(&a.account.last_activity));
            }
            Err(e) => {
                // Keep the last good rows and surface the error in the status bar
                self.ledger_error = Some(format!("{:#}", e));
            }
        }
    }

    fn total_waiting(&self) -> usize {
        self.rows.iter().map(|r| r.files.waiting).sum()
    }
}

/// Count inbox clips and delivered reels for one account
fn account_files(inbox: &Path, output: &Path, account_id: &str) -> AccountFiles {
    let mut files = AccountFiles::default();

    if let Ok(entries) = std::fs::read_dir(inbox.join(account_id)) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".skip") {
                files.refused += 1;
            } else if !name.ends_with(".why.txt") {
                files.waiting += 1;
            }
        }
    }
    // A refused clip stays in the inbox next to its marker
    files.waiting = files.waiting.saturating_sub(files.refused);

    if let Ok(entries) = std::fs::read_dir(account_output_dir(output, account_id)) {
        for entry in entries.filter_map(|e| e.ok()) {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    files.reels += 1;
                    files.reel_bytes += meta.len();
                }
            }
        }
    }

    files
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config - if no config specified, try default location first (same as daemon)
    let default_config_path = PathBuf::from("/etc/reelsd/config.toml");
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = ConverterConfig::load_config(config_path)
        .context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg);
    let mut last_reload: Option<Instant> = None;

    // Main event loop
    loop {
        if last_reload.map(|t| t.elapsed() >= RELOAD_EVERY).unwrap_or(true) {
            app.refresh();
            last_reload = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => {
                        app.should_quit = true;
                    }
                    crossterm::event::KeyCode::Char('r') => {
                        last_reload = None;
                    }
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

/// Reels converter TUI monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let top_height = 3;
    let bottom_height = 3;
    let available_height = size.height.saturating_sub(top_height + bottom_height);

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(top_height),       // CPU/Memory gauges
            Constraint::Length(available_height), // Account table
            Constraint::Length(bottom_height),    // Status bar
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);
    render_account_table(f, app, main_chunks[1]);
    render_status_bar(f, app, main_chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    // Gauges turn yellow where the converter starts degrading quality
    let color_for = |value: f64, threshold: f32, base: Color| {
        if value >= threshold as f64 { Color::Yellow } else { base }
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(color_for(cpu_usage, app.cfg.cpu_degrade_threshold_percent, Color::Cyan)))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(color_for(memory_percent, app.cfg.mem_degrade_threshold_percent, Color::Green)))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);
}

fn trial_cell(account: &Account, free_trial_count: u32) -> String {
    let left = account.free_trials_remaining(free_trial_count);
    if left == 0 {
        "used".to_string()
    } else {
        format!("{} left", left)
    }
}

fn render_account_table(f: &mut Frame, app: &mut App, area: Rect) {
    if area.height < 3 {
        let error_msg = Paragraph::new("Not enough space")
            .block(Block::default().borders(Borders::ALL).title("Accounts"));
        f.render_widget(error_msg, area);
        return;
    }

    // Top border, header and bottom border
    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ACCOUNT", "TRIAL", "PREMIUM", "USED", "LAST ACTIVE", "WAIT", "REFUSED", "REELS"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.rows.is_empty() {
        vec![Row::new(vec![
            "No accounts".to_string(),
            format!("Ledger: {}", truncate_string(&app.cfg.ledger_path.display().to_string(), 40)),
        ])]
    } else {
        app.rows
            .iter()
            .take(max_data_rows)
            .map(|row| {
                let acct = &row.account;
                let last = acct
                    .last_activity
                    .map(|t| format_age(Utc::now() - t))
                    .unwrap_or_else(|| "-".to_string());
                let reels = if row.files.reels == 0 {
                    "-".to_string()
                } else {
                    format!("{} ({})", row.files.reels, format_size(row.files.reel_bytes, DECIMAL))
                };
                Row::new(vec![
                    truncate_string(&acct.id, 20),
                    trial_cell(acct, app.cfg.free_trial_count),
                    acct.premium_balance.to_string(),
                    acct.lifetime_used.to_string(),
                    last,
                    row.files.waiting.to_string(),
                    row.files.refused.to_string(),
                    reels,
                ])
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Percentage(22), // ACCOUNT
        Constraint::Length(7),      // TRIAL
        Constraint::Length(8),      // PREMIUM
        Constraint::Length(6),      // USED
        Constraint::Length(11),     // LAST ACTIVE
        Constraint::Length(5),      // WAIT
        Constraint::Length(8),      // REFUSED
        Constraint::Percentage(20), // REELS
    ];

    let title = format!("Accounts ({}/{})", app.rows.len().min(max_data_rows), app.rows.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let status_text = match &app.ledger_error {
        Some(err) => format!("Ledger unreadable: {} | q=quit r=refresh", truncate_string(err, 60)),
        None => format!(
            "Accounts: {} | Waiting: {} | Workspaces: {} | Slots: {} | Inbox: {} | q=quit r=refresh",
            app.rows.len(),
            app.total_waiting(),
            app.temp_entries,
            app.cfg.worker_pool_size,
            truncate_string(&app.cfg.inbox_dir.display().to_string(), 30)
        ),
    };
    let style = if app.ledger_error.is_some() { Style::default().fg(Color::Red) } else { Style::default() };

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(style)
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Compact "how long ago" for the activity column
fn format_age(age: chrono::Duration) -> String {
    if age.num_seconds() < 60 {
        format!("{}s ago", age.num_seconds().max(0))
    } else if age.num_minutes() < 60 {
        format!("{}m ago", age.num_minutes())
    } else if age.num_hours() < 48 {
        format!("{}h ago", age.num_hours())
    } else {
        format!("{}d ago", age.num_days())
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
