use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};

use crate::app::{App, InputMode, summarize_error_line};
use crate::filter::FilterField;
use crate::model::{ConnectionStatus, Operation};

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(17, 94, 89);
const PL_B: Color = Color::Rgb(30, 64, 175);
const PL_C: Color = Color::Rgb(55, 48, 163);
const PL_D: Color = Color::Rgb(82, 24, 124);
const PL_E: Color = Color::Rgb(13, 148, 136);

const SLOW_OP_SECS: u64 = 60;
const STUCK_OP_SECS: u64 = 300;

pub fn render(frame: &mut Frame, app: &mut App) {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, root[0], app);
    render_body(frame, root[1], app);
    render_footer(frame, root[2], app);

    if app.show_help() {
        render_help_modal(frame, app);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let left_line = build_left_header_line(app);
    let right_line = build_right_header_line(app);
    let right_width = spans_width(&right_line.spans) as u16;
    if area.width < 60 || right_width == 0 || right_width >= area.width {
        frame.render_widget(
            Paragraph::new(left_line).style(Style::default().bg(BG).fg(Color::White)),
            area,
        );
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(1), Constraint::Length(right_width)])
        .split(area);
    frame.render_widget(
        Paragraph::new(left_line).style(Style::default().bg(BG).fg(Color::White)),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(right_line)
            .style(Style::default().bg(BG).fg(MUTED))
            .alignment(Alignment::Right),
        chunks[1],
    );
}

fn build_left_header_line(app: &App) -> Line<'static> {
    let (connection_bg, connection_fg, connection_icon) = match app.connection() {
        ConnectionStatus::Connected => (PL_B, Color::White, "󰆼"),
        ConnectionStatus::Connecting => (WARN, Color::Black, "󰔟"),
        ConnectionStatus::Disconnected(_) => (ERROR, Color::Black, "󰅛"),
    };

    let refresh = app.refresh_state();
    let refresh_label = if refresh.is_fetch_in_flight() && app.refresh_queued() {
        " 󰑓 fetching +1 ".to_string()
    } else if refresh.is_fetch_in_flight() {
        " 󰑓 fetching ".to_string()
    } else if refresh.is_paused() {
        " 󰏤 paused ".to_string()
    } else {
        format!(" 󰔛 every {}s ", refresh.interval_secs())
    };
    let refresh_bg = if refresh.is_paused() { WARN } else { PL_C };
    let refresh_fg = if refresh.is_paused() {
        Color::Black
    } else {
        Color::White
    };

    let snapshot = app.snapshot();
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, "  opsdeck ", Color::White, PL_A, connection_bg);
    push_powerline_segment(
        &mut spans,
        format!(
            " {connection_icon} {} {} ",
            compact_text(app.endpoint(), 32),
            app.connection().label()
        ),
        connection_fg,
        connection_bg,
        refresh_bg,
    );
    push_powerline_segment(&mut spans, refresh_label, refresh_fg, refresh_bg, PL_D);
    push_powerline_segment(
        &mut spans,
        format!(" 󰔟 running {} ", app.sort_direction().arrow()),
        Color::White,
        PL_D,
        PL_E,
    );
    push_powerline_segment(
        &mut spans,
        format!(" {} ops  {} sel ", snapshot.len(), app.selected_count()),
        Color::White,
        PL_E,
        BG,
    );
    Line::from(spans)
}

fn build_right_header_line(app: &App) -> Line<'static> {
    let mut parts = Vec::new();
    if let Some(scope) = app.namespace_scope() {
        parts.push(format!("󰉖 {}", compact_text(scope, 24)));
    }
    if !app.criteria().is_empty() {
        parts.push(format!("󰈲 {} filter(s)", app.criteria().active_count()));
    }
    if app.criteria().show_system_ops() {
        parts.push("󰒓 system".to_string());
    }
    let refreshed = app
        .snapshot()
        .fetched_at()
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    parts.push(format!("󰥔 {refreshed} "));

    Line::from(Span::styled(
        parts.join("  "),
        Style::default().fg(MUTED).bg(BG),
    ))
}

fn render_body(frame: &mut Frame, area: Rect, app: &mut App) {
    let (table_area, filter_area) = if app.show_filter_bar() {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(3)])
            .split(area);
        (chunks[1], Some(chunks[0]))
    } else {
        (area, None)
    };

    app.set_table_page_size(table_rows_visible(table_area));
    let (detail_width, detail_height) = detail_viewport(area);
    app.set_detail_viewport(detail_width, detail_height);

    if let Some(filter_area) = filter_area {
        render_filter_bar(frame, filter_area, app);
    }

    if let Some(operation) = app.detail() {
        render_detail(frame, table_area, operation, app.detail_scroll());
    } else {
        render_table(frame, table_area, app);
    }
}

fn render_filter_bar(frame: &mut Frame, area: Rect, app: &App) {
    let editing = app.mode() == InputMode::Filter;
    let mut spans = Vec::new();
    for field in FilterField::ALL {
        let active = editing && field == app.filter_field();
        let value = if active {
            format!("{}▏", app.input())
        } else {
            app.criteria().value(field)
        };
        if value.is_empty() && !active {
            spans.push(Span::styled(
                format!(" {}:- ", field.title()),
                Style::default().fg(MUTED),
            ));
            continue;
        }

        let style = if active {
            Style::default()
                .fg(Color::Black)
                .bg(WARN)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(ACCENT)
        };
        spans.push(Span::styled(
            format!(" {}:{} ", field.title(), compact_text(&value, 20)),
            style,
        ));
    }

    let title = format!(
        "Filters ({} active, system ops {})",
        app.criteria().active_count(),
        if app.criteria().show_system_ops() {
            "shown"
        } else {
            "hidden"
        }
    );
    let paragraph = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if editing { WARN } else { MUTED }))
            .style(Style::default().bg(PANEL)),
    );
    frame.render_widget(paragraph, area);
}

fn render_table(frame: &mut Frame, area: Rect, app: &App) {
    let snapshot = app.snapshot();
    let headers = [
        "", "OpId", "Type", "Namespace", "Running", "Client", "Description", "Users",
    ];
    let header_row = Row::new(headers.iter().map(|header| {
        Cell::from(*header).style(Style::default().add_modifier(Modifier::BOLD))
    }))
    .height(1)
    .style(Style::default().fg(ACCENT));

    let rows = snapshot
        .operations()
        .iter()
        .map(|operation| operation_row(app, operation));

    let title = if snapshot.is_empty() && app.refresh_state().last_refreshed().is_none() {
        "Operations (waiting for first refresh)".to_string()
    } else {
        format!("Operations ({})", snapshot.len())
    };
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(ACCENT))
        .style(Style::default().bg(PANEL));

    let table = Table::new(rows, column_constraints())
        .header(header_row)
        .block(block)
        .column_spacing(1)
        .row_highlight_style(
            Style::default()
                .bg(Color::Rgb(24, 36, 58))
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("󰜴 ");

    let mut state = TableState::default();
    state.select(app.cursor());
    frame.render_stateful_widget(table, area, &mut state);
}

fn operation_row(app: &App, operation: &Operation) -> Row<'static> {
    let marker = if app.is_pending(&operation.id) {
        Cell::from("⌛").style(Style::default().fg(WARN))
    } else if app.is_selected(&operation.id) {
        Cell::from("✓").style(Style::default().fg(ACCENT).add_modifier(Modifier::BOLD))
    } else {
        Cell::from(" ")
    };

    let running_color = if operation.elapsed_secs >= STUCK_OP_SECS {
        ERROR
    } else if operation.elapsed_secs >= SLOW_OP_SECS {
        WARN
    } else {
        Color::White
    };
    let text_style = if app.is_selected(&operation.id) {
        Style::default().fg(ACCENT)
    } else if operation.is_system {
        Style::default().fg(MUTED)
    } else {
        Style::default().fg(Color::White)
    };

    Row::new(vec![
        marker,
        Cell::from(operation.id.to_string()).style(text_style),
        Cell::from(operation.op_type.to_string()).style(text_style),
        Cell::from(or_dash(&operation.namespace)).style(text_style),
        Cell::from(format_running_time(operation.elapsed_secs))
            .style(Style::default().fg(running_color)),
        Cell::from(operation.client.clone().unwrap_or_else(|| "-".to_string())).style(text_style),
        Cell::from(or_dash(&operation.description)).style(text_style),
        Cell::from(operation.users_label()).style(text_style),
    ])
}

fn render_detail(frame: &mut Frame, area: Rect, operation: &Operation, scroll: u16) {
    let block = Block::default()
        .title(format!("Operation {}  (Esc to close)", operation.id))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(ACCENT))
        .style(Style::default().bg(PANEL));
    let paragraph = Paragraph::new(Text::from(operation.detail_text()))
        .block(block)
        .style(Style::default().fg(Color::White))
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0));

    frame.render_widget(paragraph, area);
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    if app.mode() == InputMode::Filter {
        let mut spans = Vec::new();
        push_powerline_segment(&mut spans, " 󰈲 flt ", Color::Black, WARN, PL_B);
        push_powerline_segment(
            &mut spans,
            format!(" {}: {} ", app.filter_field().title(), app.input()),
            Color::White,
            PL_B,
            BG,
        );
        spans.push(Span::styled(
            format!(" {}", compact_text(app.status(), area.width as usize / 2)),
            Style::default().fg(MUTED),
        ));
        frame.render_widget(
            Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
            area,
        );
        return;
    }

    let pending = app.pending_confirmation_prompt();
    let status_text = pending
        .map(|prompt| format!("{prompt}? (y/n)"))
        .unwrap_or_else(|| app.status().to_string());
    let (status_bg, status_fg) = if pending.is_some() {
        (WARN, Color::Black)
    } else {
        (PL_B, Color::White)
    };
    let (mode_label, mode_bg) = if app.kill_in_flight() {
        (format!(" 󰚌 kill {} ", app.pending_count()), ERROR)
    } else {
        (" 󰘳 nrm ".to_string(), PL_A)
    };

    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, mode_label, Color::White, mode_bg, status_bg);
    let status_width_hint = if pending.is_some() {
        area.width.saturating_sub(10) as usize
    } else {
        area.width.saturating_sub(24).min(120) as usize
    };
    push_powerline_segment(
        &mut spans,
        format!(
            " {} {} ",
            footer_status_icon(&status_text),
            compact_text(&status_text, status_width_hint.max(24))
        ),
        status_fg,
        status_bg,
        BG,
    );

    let right_spans = if pending.is_some() {
        Vec::new()
    } else {
        build_footer_glance_spans(app)
    };
    let min_left = 28u16;
    let right_width = (spans_width(&right_spans) as u16).min(area.width.saturating_sub(min_left));
    if right_width == 0 {
        frame.render_widget(
            Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
            area,
        );
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(1), Constraint::Length(right_width)])
        .split(area);
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(Line::from(right_spans))
            .style(Style::default().bg(BG))
            .alignment(Alignment::Right),
        chunks[1],
    );
}

fn build_footer_glance_spans(app: &App) -> Vec<Span<'static>> {
    let refresh = app.refresh_state();
    let Some(error) = refresh.last_error() else {
        return vec![Span::styled("? help ", Style::default().fg(MUTED))];
    };

    let mut text = format!(
        "󰅚 {}",
        compact_text(&summarize_error_line(&error.summary()), 64)
    );
    if refresh.consecutive_failures() > 1 {
        text.push_str(&format!(" (x{})", refresh.consecutive_failures()));
    }
    text.push(' ');
    vec![Span::styled(text, Style::default().fg(ERROR))]
}

fn footer_status_icon(status_text: &str) -> &'static str {
    let status = status_text.to_ascii_lowercase();
    let has_failure = [
        "failed",
        "error",
        "invalid",
        "timed out",
        "unreachable",
        "refused",
        "not authorized",
        "denied",
    ]
    .iter()
    .any(|needle| status.contains(needle));
    if has_failure { "󰅚" } else { "󰄬" }
}

fn push_powerline_segment(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
}

fn spans_width(spans: &[Span<'_>]) -> usize {
    spans.iter().map(|span| span.content.chars().count()).sum()
}

fn render_help_modal(frame: &mut Frame, app: &App) {
    let area = centered_rect(78, 72, frame.area());
    frame.render_widget(Clear, area);

    let mut lines = vec![
        Line::from(format!(
            "opsdeck help  endpoint:{}  scope:{}",
            app.endpoint(),
            app.namespace_scope().unwrap_or("all")
        )),
        Line::from(""),
    ];
    lines.extend(HELP_LINES.iter().map(|line| Line::from(*line)));

    let modal = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(modal, area);
}

const HELP_LINES: [&str; 12] = [
    "Move: j/k or arrows  g/G top/bottom  PgUp/PgDn or Ctrl+u/Ctrl+d page",
    "Select: Space toggle  a select all (again to clear)  u deselect all",
    "Kill: x, K or Delete kills the selection after a y/n confirmation",
    "Refresh: r or F5 now  p pause/resume  +/- interval (1-60s)",
    "Sort: s flips running time order",
    "Filter: / edit  f show/hide bar  c clear  S toggle system operations",
    "Filter edit: Tab/Shift+Tab field  Enter apply  Esc cancel  Ctrl+u clear field",
    "Details: Enter or d opens the operation, Esc closes",
    "Quit: q or Ctrl+c",
    "",
    "Running time turns yellow after 1 minute and red after 5 minutes.",
    "✓ selected  ⌛ kill in progress",
];

fn table_rows_visible(area: Rect) -> usize {
    area.height.saturating_sub(3).max(1) as usize
}

fn detail_viewport(area: Rect) -> (u16, u16) {
    let width = area.width.saturating_sub(2).max(1);
    let height = area.height.saturating_sub(2).max(1);
    (width, height)
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }

    if max_chars <= 1 {
        return "…".to_string();
    }

    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

fn format_running_time(secs: u64) -> String {
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn column_constraints() -> Vec<Constraint> {
    vec![
        Constraint::Length(2),
        Constraint::Length(16),
        Constraint::Length(11),
        Constraint::Percentage(18),
        Constraint::Length(9),
        Constraint::Length(22),
        Constraint::Min(12),
        Constraint::Length(14),
    ]
}

#[cfg(test)]
mod tests {
    use super::{compact_text, footer_status_icon, format_running_time, render};
    use crate::app::{App, AppCommand};
    use crate::input::Action;
    use crate::model::{Operation, OperationType};
    use ratatui::Terminal;
    use ratatui::backend::TestBackend;
    use std::time::Instant;

    fn screen_text(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        let width = buffer.area.width as usize;
        buffer
            .content()
            .chunks(width)
            .map(|row| row.iter().map(|cell| cell.symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn running_time_is_humanized() {
        assert_eq!(format_running_time(7), "7s");
        assert_eq!(format_running_time(65), "1m 05s");
        assert_eq!(format_running_time(7260), "2h 01m");
    }

    #[test]
    fn compact_text_truncates_with_ellipsis() {
        assert_eq!(compact_text("shop.orders", 20), "shop.orders");
        assert_eq!(compact_text("shop.orders", 5), "shop…");
    }

    #[test]
    fn failure_words_switch_status_icon() {
        assert_eq!(footer_status_icon("Refresh failed: timeout"), "󰅚");
        assert_eq!(footer_status_icon("Refreshed: 3 operation(s)"), "󰄬");
    }

    #[test]
    fn renders_operations_and_selection_marker() {
        let now = Instant::now();
        let mut app = App::new("db.internal:27017".to_string(), None, 5, false, now);
        let AppCommand::Fetch(ticket) = app.on_timer(now) else {
            panic!("first timer check should fetch");
        };
        let mut slow = Operation::new("4242", OperationType::Query, 125);
        slow.namespace = "shop.orders".to_string();
        app.on_fetch_complete(ticket, Ok(vec![slow]), now);
        app.apply_action(Action::ToggleSelect);

        let mut terminal = Terminal::new(TestBackend::new(140, 20)).unwrap();
        terminal.draw(|frame| render(frame, &mut app)).unwrap();
        let text = screen_text(&terminal);

        assert!(text.contains("Operations (1)"));
        assert!(text.contains("4242"));
        assert!(text.contains("shop.orders"));
        assert!(text.contains("2m 05s"));
        assert!(text.contains("✓"));
    }

    #[test]
    fn renders_kill_confirmation_prompt() {
        let now = Instant::now();
        let mut app = App::new("db:27017".to_string(), None, 5, false, now);
        let AppCommand::Fetch(ticket) = app.on_timer(now) else {
            panic!("first timer check should fetch");
        };
        app.on_fetch_complete(
            ticket,
            Ok(vec![Operation::new("7", OperationType::Update, 3)]),
            now,
        );
        app.apply_action(Action::ToggleSelect);
        app.apply_action(Action::KillSelected);

        let mut terminal = Terminal::new(TestBackend::new(120, 16)).unwrap();
        terminal.draw(|frame| render(frame, &mut app)).unwrap();
        assert!(screen_text(&terminal).contains("Kill 1 operation(s) [7]? (y/n)"));
    }
}
