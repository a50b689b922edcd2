mod clipboard;
mod help;
mod state;

use crate::model::{ConsoleConfig, ConsoleEvent, TaskStatus};
use crate::orchestrator::{self, ConsoleContext, UiCommand};
use crate::presenter;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{status_color, UiState, TAB_CONVERSION, TAB_HELP, TAB_MIGRATION};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(ctx: ConsoleContext, cfg: &ConsoleConfig) -> Result<()> {
    // Unbounded channels avoid backpressure between the UI thread and the runtime.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let initial = UiState {
        base_url: cfg.base_url.clone(),
        poll_interval: cfg.poll_interval,
        ..Default::default()
    };
    let ui_handle = std::thread::spawn(move || run_threaded(initial, event_rx, cmd_tx));

    let res = orchestrator::run_controller(ctx, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    mut state: UiState,
    mut event_rx: UnboundedReceiver<ConsoleEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep the UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if handle_key(&mut state, k, &cmd_tx) == KeyOutcome::Quit {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    break Ok(());
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

#[derive(Debug, PartialEq, Eq)]
enum KeyOutcome {
    Continue,
    Quit,
}

fn request_conversion(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>) {
    if state.converting {
        return;
    }
    if state.sql_input.trim().is_empty() {
        state.info = "Nothing to convert: press e to enter Sybase SQL".into();
        return;
    }
    state.converting = true;
    state.info = "Converting…".into();
    let _ = cmd_tx.send(UiCommand::Convert(state.sql_input.clone()));
}

fn handle_key(state: &mut UiState, k: KeyEvent, cmd_tx: &UnboundedSender<UiCommand>) -> KeyOutcome {
    if let (KeyModifiers::CONTROL, KeyCode::Char('c')) = (k.modifiers, k.code) {
        return KeyOutcome::Quit;
    }

    if state.login_required.is_some() {
        // Only quitting is possible once the session is gone.
        if k.code == KeyCode::Char('q') {
            return KeyOutcome::Quit;
        }
        return KeyOutcome::Continue;
    }

    if state.editing {
        match (k.modifiers, k.code) {
            (KeyModifiers::CONTROL, KeyCode::Char('s')) => request_conversion(state, cmd_tx),
            (_, KeyCode::Esc) => state.editing = false,
            (_, KeyCode::Enter) => state.sql_input.push('\n'),
            (_, KeyCode::Tab) => state.sql_input.push_str("    "),
            (_, KeyCode::Backspace) => {
                state.sql_input.pop();
            }
            (KeyModifiers::NONE | KeyModifiers::SHIFT, KeyCode::Char(c)) => {
                state.sql_input.push(c)
            }
            _ => {}
        }
        return KeyOutcome::Continue;
    }

    match (k.modifiers, k.code) {
        (_, KeyCode::Char('q')) => return KeyOutcome::Quit,
        (_, KeyCode::Tab) => state.tab = (state.tab + 1) % 3,
        (_, KeyCode::BackTab) => state.tab = (state.tab + 2) % 3,
        (_, KeyCode::Char('?')) => state.tab = TAB_HELP,
        (_, KeyCode::Char('s')) if k.modifiers.contains(KeyModifiers::CONTROL) => {
            request_conversion(state, cmd_tx)
        }
        (_, KeyCode::Char('s')) => {
            if state.can_start() {
                state.starting = true;
                state.info = "Starting migration…".into();
                state.tab = TAB_MIGRATION;
                let _ = cmd_tx.send(UiCommand::StartMigration);
            } else {
                state.info = "A migration task is already running".into();
            }
        }
        (_, KeyCode::Char('e')) => {
            state.tab = TAB_CONVERSION;
            state.editing = true;
        }
        (_, KeyCode::Char('c')) => {
            state.tab = TAB_CONVERSION;
            request_conversion(state, cmd_tx);
        }
        (_, KeyCode::Char('x')) => {
            state.conversion = None;
            let _ = cmd_tx.send(UiCommand::ClearConversion);
            state.info = "Conversion output cleared".into();
        }
        (_, KeyCode::Char('y')) => match state.conversion.as_ref() {
            Some(r) if !r.is_failure_marker() => match clipboard::copy_to_clipboard(&r.converted_sql) {
                Ok(()) => state.info = "Copied converted SQL to clipboard".into(),
                Err(e) => state.info = format!("Copy failed: {e:#}"),
            },
            _ => state.info = "No converted SQL to copy".into(),
        },
        _ => {}
    }
    KeyOutcome::Continue
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    if let Some(login_url) = state.login_required.as_deref() {
        return draw_login_required(area, f, login_url);
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(1)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Migration"),
        Line::from("Conversion"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("migration-console"),
    )
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        TAB_MIGRATION => draw_migration(chunks[1], f, state),
        TAB_CONVERSION => draw_conversion(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }

    f.render_widget(
        Paragraph::new(Line::from(Span::styled(
            state.info.clone(),
            Style::default().fg(Color::Gray),
        ))),
        chunks[2],
    );
}

fn draw_migration(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(7), Constraint::Min(0)].as_ref())
        .split(area);
    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(rows[0]);

    let status = state.task.status;
    let label = if state.starting {
        "starting…".to_string()
    } else if status == TaskStatus::Running {
        "migrating…".to_string()
    } else {
        status.to_string()
    };
    let status_lines = vec![
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::styled(
                label,
                Style::default()
                    .fg(status_color(status))
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::styled("Task: ", Style::default().fg(Color::Gray)),
            Span::raw(
                state
                    .task
                    .task_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into()),
            ),
        ]),
        Line::from(vec![
            Span::styled("Polling: ", Style::default().fg(Color::Gray)),
            Span::raw(if state.polling {
                format!("every {}", humantime::format_duration(state.poll_interval))
            } else {
                "off".into()
            }),
        ]),
        Line::from(vec![
            Span::styled("Service: ", Style::default().fg(Color::Gray)),
            Span::raw(state.base_url.clone()),
        ]),
        Line::from(Span::styled(
            "s: start migration",
            Style::default().fg(Color::DarkGray),
        )),
    ];
    f.render_widget(
        Paragraph::new(status_lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Database Migration"),
        ),
        top[0],
    );

    let progress_lines: Vec<Line> = presenter::progress_fields(state.task.progress.as_ref())
        .iter()
        .map(|(label, value)| {
            Line::from(vec![
                Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
                Span::styled(value.to_string(), Style::default().fg(Color::Cyan)),
            ])
        })
        .collect();
    f.render_widget(
        Paragraph::new(progress_lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Migration Progress"),
        ),
        top[1],
    );

    draw_log(rows[1], f, state);
}

fn draw_log(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let visible = area.height.saturating_sub(2) as usize;
    let start = state.log.len().saturating_sub(visible);
    let lines: Vec<Line> = state.log[start..]
        .iter()
        .map(|(ts, msg)| {
            Line::from(vec![
                Span::styled(format!("{ts} "), Style::default().fg(Color::DarkGray)),
                Span::raw(msg.clone()),
            ])
        })
        .collect();
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Activity")),
        area,
    );
}

fn draw_conversion(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(area);

    let mut input: Vec<Line> = state
        .sql_input
        .split('\n')
        .map(|l| Line::from(l.to_string()))
        .collect();
    if state.editing {
        if let Some(last) = input.last_mut() {
            last.spans.push(Span::styled("▏", Style::default().fg(Color::Yellow)));
        }
    }
    let input_title = if state.editing {
        "Sybase SQL Input (editing, Esc to stop, Ctrl-S to convert)"
    } else {
        "Sybase SQL Input (e to edit)"
    };
    let input_style = if state.editing {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    f.render_widget(
        Paragraph::new(input)
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_style(input_style)
                    .title(input_title),
            ),
        panes[0],
    );

    let mut output: Vec<Line> = Vec::new();
    if state.converting {
        output.push(Line::from(Span::styled(
            "Converting…",
            Style::default().fg(Color::Gray),
        )));
    } else if let Some(result) = state.conversion.as_ref() {
        let sql_style = if result.is_failure_marker() {
            Style::default().fg(Color::Red)
        } else {
            Style::default().fg(Color::Green)
        };
        let n_sql = result.converted_sql.lines().count();
        for (i, line) in presenter::conversion_lines(Some(result)).into_iter().enumerate() {
            if i < n_sql {
                output.push(Line::from(Span::styled(line, sql_style)));
            } else {
                output.push(Line::from(Span::styled(line, Style::default().fg(Color::Yellow))));
            }
        }
    }
    f.render_widget(
        Paragraph::new(output)
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title("PostgreSQL Output"),
            ),
        panes[1],
    );
}

fn draw_login_required(area: Rect, f: &mut ratatui::Frame, login_url: &str) {
    let p = Paragraph::new(vec![
        Line::from(Span::styled(
            "Session expired",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from("The migration service rejected the stored token. It has been removed."),
        Line::from(vec![
            Span::raw("Log in again at "),
            Span::styled(login_url.to_string(), Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("or run "),
            Span::styled(
                "migration-console login --username <name>",
                Style::default().fg(Color::Magenta),
            ),
        ]),
        Line::from(""),
        Line::from("Press q to quit."),
    ])
    .wrap(Wrap { trim: false })
    .block(Block::default().borders(Borders::ALL).title("Login required"));
    f.render_widget(p, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn start_key_sends_one_command_until_task_finishes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = UiState::default();

        handle_key(&mut state, key(KeyCode::Char('s')), &tx);
        handle_key(&mut state, key(KeyCode::Char('s')), &tx);
        assert!(matches!(rx.try_recv(), Ok(UiCommand::StartMigration)));
        assert!(rx.try_recv().is_err());
        assert!(state.starting);
    }

    #[test]
    fn editing_collects_sql_and_ctrl_s_converts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = UiState::default();

        handle_key(&mut state, key(KeyCode::Char('e')), &tx);
        assert!(state.editing);
        for c in "select 1".chars() {
            handle_key(&mut state, key(KeyCode::Char(c)), &tx);
        }
        // 'q' while editing is text, not quit
        assert_eq!(
            handle_key(&mut state, key(KeyCode::Char('q')), &tx),
            KeyOutcome::Continue
        );
        handle_key(&mut state, key(KeyCode::Backspace), &tx);
        handle_key(
            &mut state,
            KeyEvent::new(KeyCode::Char('s'), KeyModifiers::CONTROL),
            &tx,
        );
        match rx.try_recv() {
            Ok(UiCommand::Convert(sql)) => assert_eq!(sql, "select 1"),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(state.converting);
    }

    #[test]
    fn editing_ignores_modified_letters() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut state = UiState {
            editing: true,
            ..Default::default()
        };

        handle_key(&mut state, KeyEvent::new(KeyCode::Char('a'), KeyModifiers::CONTROL), &tx);
        handle_key(&mut state, KeyEvent::new(KeyCode::Char('x'), KeyModifiers::ALT), &tx);
        handle_key(&mut state, KeyEvent::new(KeyCode::Char('S'), KeyModifiers::SHIFT), &tx);
        handle_key(&mut state, key(KeyCode::Char('t')), &tx);
        assert_eq!(state.sql_input, "St");
    }

    #[test]
    fn login_screen_only_allows_quit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = UiState {
            login_required: Some("/login".into()),
            ..Default::default()
        };
        assert_eq!(
            handle_key(&mut state, key(KeyCode::Char('s')), &tx),
            KeyOutcome::Continue
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(
            handle_key(&mut state, key(KeyCode::Char('q')), &tx),
            KeyOutcome::Quit
        );
    }
}
