use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::DefaultTerminal;

use crate::arp::Arpeggiator;
use crate::keyboard::Keyboard;
use crate::seq::Sequencer;
use crate::timer::Device;
use crate::view;

const NUM_VOICES: usize = 4;
const DEFAULT_BPM: f64 = 120.0;
const SEQ_STEPS: usize = 16;
const FRAME_TIME: Duration = Duration::from_millis(16);

pub struct App {
    pub keyboard: Keyboard,
    pub sequencer: Sequencer,
    pub octave: u8,
    should_stop: bool,
}

pub enum Action {
    Exit,
    ToggleNote(u8),
    ToggleArpeggiator,
    ToggleSequencer,
    CycleArpMode,
    ToggleSustain,
    NudgeBpm(f64),
}

impl App {
    pub fn new() -> Self {
        let mut keyboard = Keyboard::new(NUM_VOICES);
        keyboard.attach_arpeggiator(Arpeggiator::new(DEFAULT_BPM));

        // four-on-the-floor demo pattern
        let mut sequencer = Sequencer::new(SEQ_STEPS, 1, DEFAULT_BPM);
        for position in (0..SEQ_STEPS).step_by(4) {
            sequencer.set_note(position, 36, 1.0, 0);
        }

        Self {
            keyboard,
            sequencer,
            octave: 4,
            should_stop: false,
        }
    }

    pub fn run(mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        loop {
            if self.should_stop {
                return Ok(());
            }
            terminal.draw(|f| view::render(f, &self))?;
            if event::poll(FRAME_TIME)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        if let Some(action) = map_key(key) {
                            self.take(action);
                        }
                    }
                }
            }
            self.keyboard.service_arpeggiator();
            self.sequencer.service();
        }
    }

    pub fn take(&mut self, action: Action) {
        match action {
            Action::Exit => self.should_stop = true,
            Action::ToggleNote(offset) => {
                let pitch = self.octave * 12 + offset;
                if self.keyboard.has_note(pitch, false) {
                    self.keyboard.remove(pitch, false);
                } else {
                    self.keyboard.append(pitch, 1.0, None);
                }
            }
            Action::ToggleArpeggiator => {
                let enabled = self
                    .keyboard
                    .arpeggiator()
                    .map_or(false, Arpeggiator::is_enabled);
                self.keyboard.set_arpeggiator_enabled(!enabled);
            }
            Action::ToggleSequencer => {
                self.sequencer.timer_mut().toggle();
            }
            Action::CycleArpMode => {
                if let Some(arp) = self.keyboard.arpeggiator_mut() {
                    arp.set_mode(arp.mode().next());
                }
            }
            Action::ToggleSustain => {
                let sustain = self.keyboard.sustain();
                self.keyboard.set_sustain(!sustain);
            }
            Action::NudgeBpm(delta) => {
                if let Some(arp) = self.keyboard.arpeggiator_mut() {
                    let bpm = arp.timer().bpm();
                    arp.timer_mut().set_bpm(bpm + delta);
                }
                let bpm = self.sequencer.timer().bpm();
                self.sequencer.timer_mut().set_bpm(bpm + delta);
            }
        }
    }
}

fn map_key(key: KeyEvent) -> Option<Action> {
    let action = match key.code {
        KeyCode::Char('q') | KeyCode::Esc => Action::Exit,
        KeyCode::Char(' ') => Action::ToggleArpeggiator,
        KeyCode::Char('p') => Action::ToggleSequencer,
        KeyCode::Tab => Action::CycleArpMode,
        KeyCode::Enter => Action::ToggleSustain,
        KeyCode::Up => Action::NudgeBpm(5.0),
        KeyCode::Down => Action::NudgeBpm(-5.0),
        KeyCode::Char(ch) => Action::ToggleNote(key_to_pitch(ch)?),
        _ => return None,
    };
    Some(action)
}

fn key_to_pitch(ch: char) -> Option<u8> {
    let pitch = match ch {
        'z' => 0,
        's' => 1,
        'x' => 2,
        'd' => 3,
        'c' => 4,
        'v' => 5,
        'g' => 6,
        'b' => 7,
        'h' => 8,
        'n' => 9,
        'j' => 10,
        'm' => 11,
        _ => return None,
    };
    Some(pitch)
}
