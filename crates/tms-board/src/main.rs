use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Terminal,
};
use std::{
    collections::VecDeque,
    fs::OpenOptions,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tms_board::{
    transport::DEFAULT_REQUEST_TIMEOUT, ActivityStore, EventOutcome, HttpTransport, Notification,
    PageContext, PageSignal,
};
use tms_core::{
    clock::{Clock, SystemClock},
    indicator::IndicatorTone,
    sync_contracts::SyncDomain,
    view::{Opacity, ReloadReason, RowNode},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:5080";
const TICK_MS: u64 = 100;
const NOTE_TTL_MS: i64 = 4_000;
const MAX_NOTIFICATIONS: usize = 5;

#[derive(Clone, Debug)]
struct Config {
    hub_url: String,
    page: String,
    poll_interval_ms: Option<u64>,
    state_dir: PathBuf,
}

#[derive(Parser, Debug)]
#[command(name = "tms-board")]
struct Args {
    /// Hub address, `host:port` or a full URL.
    #[arg(long, default_value = "")]
    hub: String,
    /// Page to open: `routes` or `students`.
    #[arg(long, default_value = "")]
    page: String,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    #[arg(long, default_value = "")]
    state_dir: String,
}

struct App {
    config: Config,
    clock: Arc<dyn Clock>,
    ctx: PageContext,
    selected: usize,
    status_note: Option<(String, i64)>,
    notifications: VecDeque<Notification>,
}

impl App {
    fn note(&mut self, message: impl Into<String>) {
        let until = self.clock.now_ms() + NOTE_TTL_MS;
        self.status_note = Some((message.into(), until));
    }

    fn expire_note(&mut self) {
        let now = self.clock.now_ms();
        if matches!(&self.status_note, Some((_, until)) if now >= *until) {
            self.status_note = None;
        }
    }

    fn report(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Cycled(status) => {
                self.note(format!("Route status changed to {}!", status.label()))
            }
            EventOutcome::Reloaded(ReloadReason::Requested) => self.note("Reloaded"),
            EventOutcome::Reloaded(_) | EventOutcome::ReloadRequested(_) => {}
            EventOutcome::RefreshStaged => {}
        }
    }

    fn collect_notifications(&mut self) {
        for notification in self.ctx.drain_notifications() {
            self.notifications.push_front(notification);
        }
        self.notifications.truncate(MAX_NOTIFICATIONS);
    }

    fn clamp_selection(&mut self) {
        let len = self.ctx.document().rows().len();
        if len == 0 {
            self.selected = 0;
        } else if self.selected >= len {
            self.selected = len - 1;
        }
    }

    fn move_selection(&mut self, step: i32) {
        let len = self.ctx.document().rows().len();
        if len == 0 {
            return;
        }
        let next = (self.selected as i64 + step as i64).rem_euclid(len as i64);
        self.selected = next as usize;
    }

    fn selected_key(&self) -> Option<String> {
        self.ctx
            .document()
            .rows()
            .get(self.selected)
            .map(|row| row.key.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config();
    init_logging(&config);

    let transport = HttpTransport::new(&config.hub_url, DEFAULT_REQUEST_TIMEOUT)
        .context("building http client")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ctx = PageContext::new(
        &config.page,
        config.poll_interval_ms,
        clock.clone(),
        Arc::new(transport),
        ActivityStore::in_dir(&config.state_dir),
    );
    if !ctx.is_live() {
        anyhow::bail!(
            "page {:?} has no live board; use \"routes\" or \"students\"",
            config.page
        );
    }
    let mut app = App {
        config,
        clock,
        ctx,
        selected: 0,
        status_note: None,
        notifications: VecDeque::new(),
    };
    info!(event = "board_start", page = %app.config.page, hub = %app.config.hub_url);
    if let Err(err) = app.ctx.open().await {
        warn!(event = "initial_load_failed", error = %err);
        app.note(format!("Waiting for hub: {err}"));
    }

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = run(&mut terminal, &mut app, &mut events, &mut ticker).await;

    app.ctx.stop();
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    info!(event = "board_stop");
    outcome
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    events: &mut EventStream,
    ticker: &mut tokio::time::Interval,
) -> Result<()> {
    loop {
        app.clamp_selection();
        terminal.draw(|frame| render_ui(frame, app))?;
        tokio::select! {
            _ = ticker.tick() => {
                app.ctx.tick();
                app.expire_note();
            }
            signal = app.ctx.next_signal() => {
                match signal {
                    PageSignal::Poll(result) => {
                        app.ctx.handle_poll_result(result);
                        app.collect_notifications();
                    }
                    PageSignal::Page(event) => match app.ctx.handle_event(event) {
                        Ok(outcome) => app.report(outcome),
                        Err(err) => app.note(err.to_string()),
                    },
                }
            }
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    if handle_input(event, app) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Returns true when the board should exit. Nothing here waits on the
/// network; writes and reloads settle later through `next_signal`.
fn handle_input(event: Event, app: &mut App) -> bool {
    let Event::Key(KeyEvent {
        code,
        modifiers,
        kind,
        ..
    }) = event
    else {
        return false;
    };
    if kind != KeyEventKind::Press {
        return false;
    }
    match code {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return true,
        KeyCode::Up | KeyCode::Char('k') => app.move_selection(-1),
        KeyCode::Down | KeyCode::Char('j') => app.move_selection(1),
        KeyCode::Enter | KeyCode::Char(' ') => {
            if app.ctx.domain() != Some(SyncDomain::Routes) {
                return false;
            }
            let Some(route_id) = app.selected_key() else {
                return false;
            };
            if let Err(err) = app.ctx.cycle_route(&route_id) {
                app.note(err.to_string());
            }
        }
        KeyCode::Char('r') => {
            if app.ctx.full_reload(ReloadReason::Requested) {
                app.note("Reloading");
            } else {
                app.note("Reload queued");
            }
        }
        _ => {}
    }
    false
}

fn tone_color(tone: IndicatorTone) -> Color {
    match tone {
        IndicatorTone::Ok => Color::Green,
        IndicatorTone::Warn => Color::Yellow,
        IndicatorTone::Critical => Color::Red,
    }
}

fn badge_color(color: &str) -> Color {
    match color {
        "success" => Color::Green,
        "warning" => Color::Yellow,
        "danger" => Color::Red,
        _ => Color::Gray,
    }
}

fn render_ui(frame: &mut ratatui::Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(MAX_NOTIFICATIONS as u16 + 2),
            Constraint::Length(1),
        ])
        .split(frame.size());
    frame.render_widget(render_header(app), chunks[0]);
    render_table(frame, app, chunks[1]);
    frame.render_widget(render_notifications(app), chunks[2]);
    frame.render_widget(render_footer(app), chunks[3]);
}

fn render_header(app: &App) -> Paragraph<'static> {
    let mut spans = vec![
        Span::styled(
            "Hamilton TMS",
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("  {}  ", app.ctx.page())),
        Span::styled(app.config.hub_url.clone(), Style::default().fg(Color::DarkGray)),
    ];
    if let (Some(label), Some(tone)) = (app.ctx.indicator().label(), app.ctx.indicator().tone()) {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            format!("[{label}]"),
            Style::default().fg(tone_color(tone)),
        ));
    }
    Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL))
}

fn render_table(frame: &mut ratatui::Frame, app: &App, area: Rect) {
    let document = app.ctx.document();
    let dim = document.opacity() == Opacity::Faded;
    let rows: Vec<Row> = document.rows().iter().map(|row| table_row(row, dim)).collect();
    let (header, widths) = match app.ctx.domain() {
        Some(SyncDomain::Students) => (
            Row::new(vec!["Name", "Route"]),
            vec![Constraint::Percentage(60), Constraint::Percentage(40)],
        ),
        _ => (
            Row::new(vec!["Route", "School", "Guide", "Status"]),
            vec![
                Constraint::Length(8),
                Constraint::Percentage(40),
                Constraint::Length(9),
                Constraint::Min(16),
            ],
        ),
    };
    let title = if document.body().is_some() {
        format!(" {} rows ", document.rows().len())
    } else {
        " no table ".to_string()
    };
    let table = Table::new(rows, widths)
        .header(header.style(Style::default().add_modifier(Modifier::BOLD)))
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = TableState::default();
    if !document.rows().is_empty() {
        state.select(Some(app.selected));
    }
    frame.render_stateful_widget(table, area, &mut state);
}

fn table_row(row: &RowNode, dim: bool) -> Row<'static> {
    let mut cells: Vec<Cell> = row.cells.iter().map(|cell| Cell::from(cell.clone())).collect();
    if let Some(view) = &row.view {
        cells.push(Cell::from(Span::styled(
            view.label,
            Style::default()
                .fg(badge_color(view.status.color()))
                .add_modifier(Modifier::BOLD),
        )));
    }
    let style = if dim {
        Style::default().add_modifier(Modifier::DIM)
    } else {
        Style::default()
    };
    Row::new(cells).style(style)
}

fn render_notifications(app: &App) -> Paragraph<'static> {
    let lines: Vec<Line> = app
        .notifications
        .iter()
        .map(|notification| {
            let at = DateTime::<Utc>::from_timestamp_millis(notification.at_ms)
                .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
                .unwrap_or_default();
            Line::from(vec![
                Span::styled(format!("{at} "), Style::default().fg(Color::DarkGray)),
                Span::styled(notification.message.clone(), Style::default().fg(Color::Green)),
            ])
        })
        .collect();
    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Notifications "))
}

fn render_footer(app: &App) -> Paragraph<'static> {
    let text = match &app.status_note {
        Some((note, _)) => note.clone(),
        None => "up/down select  enter cycle status  r reload  q quit".to_string(),
    };
    Paragraph::new(Line::from(Span::styled(
        text,
        Style::default().fg(Color::Gray),
    )))
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        hub_url: resolve_hub_url(&args.hub),
        page: resolve_page(&args.page),
        poll_interval_ms: args.poll_interval_ms.or_else(resolve_poll_interval),
        state_dir: resolve_state_dir(&args.state_dir),
    }
}

/// Logs go to `tms-board.log` in the state dir; the terminal belongs to the UI.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_true("TMS_LOG_STDOUT") {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }
    let file = std::fs::create_dir_all(&config.state_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.state_dir.join("tms-board.log"))
    });
    match file {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}

fn env_true(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    )
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_hub_url(hub_flag: &str) -> String {
    let raw = if !hub_flag.trim().is_empty() {
        hub_flag.trim().to_string()
    } else {
        env_non_empty("TMS_HUB_ADDR").unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string())
    };
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw
    } else {
        format!("http://{raw}")
    }
}

fn resolve_page(page_flag: &str) -> String {
    if !page_flag.trim().is_empty() {
        return page_flag.trim().to_string();
    }
    env_non_empty("TMS_BOARD_PAGE").unwrap_or_else(|| "routes".to_string())
}

fn resolve_poll_interval() -> Option<u64> {
    env_non_empty("TMS_POLL_INTERVAL_MS").and_then(|value| value.trim().parse().ok())
}

fn resolve_state_dir(state_flag: &str) -> PathBuf {
    if !state_flag.trim().is_empty() {
        return PathBuf::from(state_flag);
    }
    if let Some(value) = env_non_empty("TMS_STATE_DIR") {
        return PathBuf::from(value);
    }
    if let Some(value) = env_non_empty("XDG_STATE_HOME") {
        return PathBuf::from(value).join("hamilton-tms");
    }
    if let Some(value) = env_non_empty("HOME") {
        return PathBuf::from(value)
            .join(".local")
            .join("state")
            .join("hamilton-tms");
    }
    PathBuf::from(".tms/state")
}
