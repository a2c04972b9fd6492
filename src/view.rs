use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List as ListView, ListItem, Paragraph},
    Frame,
};

use crate::app::App;
use crate::timer::Device;

const BORDER_COLOR: Color = Color::DarkGray;

pub fn render(f: &mut Frame, app: &App) {
    let screen = f.area();
    let sections = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Min(4),
                Constraint::Length(3),
                Constraint::Length(1),
            ]
            .as_ref(),
        )
        .split(screen);

    render_voices(f, app, sections[0]);
    render_sequencer(f, app, sections[1]);
    render_status_line(f, app, sections[2]);
}

fn render_voices(f: &mut Frame, app: &App, area: ratatui::layout::Rect) {
    let voices: Vec<ListItem> = app
        .keyboard
        .voices()
        .iter()
        .map(|voice| {
            let line = match voice.note() {
                Some(note) => format!(
                    " {} {:>4} {:.2}",
                    voice.index(),
                    pitch_name(note.notenum),
                    note.velocity
                ),
                None => format!(" {} ...", voice.index()),
            };
            ListItem::new(line)
        })
        .collect();

    let block = Block::default()
        .title(" voices ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER_COLOR));
    f.render_widget(ListView::new(voices).block(block), area);
}

fn render_sequencer(f: &mut Frame, app: &App, area: ratatui::layout::Rect) {
    let seq = &app.sequencer;
    let playing = seq.timer().is_enabled();
    let mut spans = Vec::new();
    for position in 0..seq.length() {
        let cell = match seq.get_note(position, 0) {
            Some(note) if !note.is_rest() => "[x]",
            _ => "[ ]",
        };
        let style = if playing && position == seq.position() {
            Style::default().add_modifier(Modifier::REVERSED)
        } else {
            Style::default()
        };
        spans.push(Span::styled(cell, style));
    }

    let block = Block::default()
        .title(" steps ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER_COLOR));
    f.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
}

fn render_status_line(f: &mut Frame, app: &App, area: ratatui::layout::Rect) {
    let arp = app.keyboard.arpeggiator();
    let bpm = arp.map_or(0.0, |arp| arp.timer().bpm());
    let arp_state = match arp {
        Some(arp) if arp.is_enabled() => arp.mode().name(),
        _ => "off",
    };
    let sustain = if app.keyboard.sustain() { "on" } else { "off" };
    let held = app.keyboard.notes(true).len();

    let line = Line::from(vec![
        Span::raw(format!(" bpm {:>3} ", bpm)),
        Span::raw(format!("| arp {} ", arp_state)),
        Span::raw(format!(
            "| seq {} ",
            if app.sequencer.timer().is_enabled() {
                "on"
            } else {
                "off"
            }
        )),
        Span::raw(format!("| sustain {} ", sustain)),
        Span::raw(format!("| notes {} ", held)),
        Span::raw(format!("| oct {} ", app.octave)),
    ]);
    let paragraph =
        Paragraph::new(line).style(Style::default().add_modifier(Modifier::REVERSED));
    f.render_widget(paragraph, area);
}

fn pitch_name(pitch: u8) -> String {
    const NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    let octave = (pitch / 12) as i8 - 1;
    format!("{}{}", NAMES[(pitch % 12) as usize], octave)
}
