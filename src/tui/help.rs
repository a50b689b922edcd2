use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &str, pad: usize, action: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key.to_string(), Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(action.to_string()),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit"),
        ]),
        key_line("s", 11, "Start migration"),
        key_line("tab", 9, "Switch tabs"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Conversion tab:"),
        key_line("e", 11, "Edit Sybase SQL input"),
        key_line("Esc", 9, "Stop editing"),
        key_line("Ctrl-S", 6, "Convert (also while editing)"),
        key_line("c", 11, "Convert"),
        key_line("x", 11, "Clear output"),
        key_line("y", 11, "Copy converted SQL to clipboard"),
        Line::from(""),
        Line::from("Status is polled every few seconds until the task completes."),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
