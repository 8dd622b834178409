mod tui_app;

use std::io;
use std::time::Duration;

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use tui_app::{format_duration, format_opt_timestamp, format_timestamp, truncate, AppState, ConnectionStatus};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    // Manual triggers wait for a full reconcile, so the timeout is generous.
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(io::Error::other)?;

    let mut app = AppState::new(base_url);

    // Initial fetch before rendering
    app.refresh(&client).await;

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut runs_table_state = TableState::default();
    runs_table_state.select(None);

    let result = run_loop(&mut terminal, &mut app, &client, &mut runs_table_state).await;

    // Restore terminal regardless of result
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut AppState,
    client: &reqwest::Client,
    runs_state: &mut TableState,
) -> io::Result<()> {
    let refresh_interval = Duration::from_secs(2);
    let mut last_tick = std::time::Instant::now();

    loop {
        terminal.draw(|f| render(f, app, runs_state))?;

        let timeout = refresh_interval
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => return Ok(()),
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            app.refresh(client).await;
                            last_tick = std::time::Instant::now();
                        }
                        KeyCode::Char('t') | KeyCode::Char('T') => {
                            app.last_trigger = Some("trigger: running...".to_string());
                            terminal.draw(|f| render(f, app, runs_state))?;
                            app.trigger(client).await;
                            app.refresh(client).await;
                            last_tick = std::time::Instant::now();
                        }
                        KeyCode::Down | KeyCode::Char('j') => {
                            let max = app.runs.len().saturating_sub(1);
                            let next = runs_state.selected().map_or(0, |i| (i + 1).min(max));
                            runs_state.select(Some(next));
                        }
                        KeyCode::Up | KeyCode::Char('k') => {
                            let prev = runs_state.selected().map_or(0, |i| i.saturating_sub(1));
                            runs_state.select(Some(prev));
                        }
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= refresh_interval {
            app.refresh(client).await;
            last_tick = std::time::Instant::now();
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, app: &AppState, runs_state: &mut TableState) {
    let area = f.area();

    // Outer vertical split: header | schedule | body | footer
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Length(4), // schedule
            Constraint::Min(0),    // body
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, app, chunks[0]);
    render_schedule(f, app, chunks[1]);
    render_body(f, app, runs_state, chunks[2]);
    render_footer(f, app, chunks[3]);
}

fn render_header(f: &mut Frame, app: &AppState, area: Rect) {
    let (status_text, status_color) = match &app.status {
        ConnectionStatus::Connected => ("● connected".to_string(), Color::Green),
        ConnectionStatus::Connecting => ("◌ connecting".to_string(), Color::Yellow),
        ConnectionStatus::Error(e) => (format!("✗ {}", truncate(e, 40)), Color::Red),
    };

    let latency = &app.health.upstream_latency;
    let latency_str = latency
        .p95_ms
        .map_or("—".to_string(), |v| format!("p95 {v}ms ({} req)", latency.samples));

    let title_spans = vec![
        Span::styled(
            " Price Sync  ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  "),
        Span::styled(
            format!("{} prices", app.health.price_count),
            Style::default().fg(Color::White),
        ),
        Span::raw("  │  "),
        Span::styled(
            format!("{} runs / {} errors", app.health.reconcile_runs, app.health.reconcile_errors),
            Style::default().fg(Color::White),
        ),
        Span::raw("  │  "),
        Span::styled(latency_str, Style::default().fg(Color::White)),
    ];

    let paragraph = Paragraph::new(Line::from(title_spans))
        .block(Block::default().borders(Borders::ALL).border_style(
            Style::default().fg(Color::DarkGray),
        ));

    f.render_widget(paragraph, area);
}

fn render_schedule(f: &mut Frame, app: &AppState, area: Rect) {
    let s = &app.sync;
    let state_color = match s.state.as_str() {
        "suppressed" => Color::Green,
        "active_polling" => Color::Yellow,
        "armed_pre_window" => Color::Cyan,
        "stopped" => Color::Red,
        _ => Color::White,
    };
    let busy = if s.reconcile_in_flight { "  (reconciling)" } else { "" };

    let first = Line::from(vec![
        Span::raw(" state: "),
        Span::styled(format!("{}{busy}", s.state), Style::default().fg(state_color)),
        Span::raw("   next run: "),
        Span::styled(format_opt_timestamp(s.next_run_at.as_deref()), Style::default().fg(Color::White)),
        Span::raw("   last check: "),
        Span::styled(format_opt_timestamp(s.last_check_at.as_deref()), Style::default().fg(Color::White)),
    ]);
    let second = Line::from(vec![
        Span::raw(" suppressed: "),
        Span::styled(
            s.suppressed_date.clone().unwrap_or_else(|| "—".to_string()),
            Style::default().fg(Color::White),
        ),
        Span::raw("   last success: "),
        Span::styled(format_opt_timestamp(s.last_success_at.as_deref()), Style::default().fg(Color::White)),
        Span::raw("   watchdog: "),
        on_off(s.watchdog_active),
        Span::raw("  fallback: "),
        on_off(s.fallback_active),
    ]);

    let paragraph = Paragraph::new(vec![first, second]).block(
        Block::default()
            .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
            .border_style(Style::default().fg(Color::DarkGray)),
    );
    f.render_widget(paragraph, area);
}

fn on_off(active: bool) -> Span<'static> {
    if active {
        Span::styled("on", Style::default().fg(Color::Green))
    } else {
        Span::styled("off", Style::default().fg(Color::Red))
    }
}

fn render_body(f: &mut Frame, app: &AppState, runs_state: &mut TableState, area: Rect) {
    // Horizontal split: watermarks (35%) | runs (65%)
    let halves = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(area);

    render_watermarks_table(f, app, halves[0]);
    render_runs_table(f, app, runs_state, halves[1]);
}

fn render_watermarks_table(f: &mut Frame, app: &AppState, area: Rect) {
    let header_cells = ["Entity", "Complete through", "Latest", "Trust"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1);

    let rows: Vec<Row> = app
        .watermarks
        .iter()
        .map(|w| {
            let (trust, trust_color) = if w.trustworthy {
                ("yes", Color::Green)
            } else {
                ("no", Color::Red)
            };
            Row::new(vec![
                Cell::from(w.entity.to_uppercase()).style(Style::default().fg(Color::Cyan)),
                Cell::from(w.last_complete_date.clone()),
                Cell::from(format_opt_timestamp(w.last_complete_instant.as_deref()))
                    .style(Style::default().fg(Color::DarkGray)),
                Cell::from(trust).style(Style::default().fg(trust_color)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Length(16),
            Constraint::Min(14),
            Constraint::Length(5),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " WATERMARKS ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    );

    f.render_widget(table, area);
}

fn render_runs_table(f: &mut Frame, app: &AppState, state: &mut TableState, area: Rect) {
    let header_cells = ["Started", "Kind", "Status", "New", "Upd", "Duration", "Error"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1);

    let rows: Vec<Row> = app
        .runs
        .iter()
        .map(|r| {
            let status_color = match r.status.as_str() {
                "success" => Color::Green,
                "error" => Color::Red,
                "skipped" => Color::DarkGray,
                _ => Color::Yellow,
            };
            let error = r.error_message.as_deref().map_or(String::new(), |e| truncate(e, 40));

            Row::new(vec![
                Cell::from(format_timestamp(&r.started_at)).style(Style::default().fg(Color::DarkGray)),
                Cell::from(r.kind.clone()),
                Cell::from(r.status.clone()).style(Style::default().fg(status_color)),
                Cell::from(r.records.created.to_string()),
                Cell::from(r.records.updated.to_string()),
                Cell::from(format_duration(r.duration_ms)),
                Cell::from(error).style(Style::default().fg(Color::Red)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(14),
            Constraint::Length(14),
            Constraint::Length(8),
            Constraint::Length(6),
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " RECENT RUNS ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    )
    .row_highlight_style(
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );

    f.render_stateful_widget(table, area, state);
}

fn render_footer(f: &mut Frame, app: &AppState, area: Rect) {
    let mut spans = vec![
        Span::styled(" [q] ", Style::default().fg(Color::Yellow)),
        Span::raw("quit  "),
        Span::styled("[r] ", Style::default().fg(Color::Yellow)),
        Span::raw("refresh  "),
        Span::styled("[t] ", Style::default().fg(Color::Yellow)),
        Span::raw("trigger sync  "),
        Span::styled("[↑↓ / j k] ", Style::default().fg(Color::Yellow)),
        Span::raw("scroll runs  "),
    ];
    match &app.last_trigger {
        Some(msg) => spans.push(Span::styled(msg.clone(), Style::default().fg(Color::Cyan))),
        None => spans.push(Span::styled("auto-refresh: 2s", Style::default().fg(Color::DarkGray))),
    }
    let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().fg(Color::White));
    f.render_widget(paragraph, area);
}
