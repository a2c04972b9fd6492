use rand::Rng;

use crate::note::Note;
use crate::timer::{Device, StepDivision, Timer};

/// Note ordering applied to the held set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpMode {
    Up,
    Down,
    UpDown,
    DownUp,
    Played,
    Random,
}

impl ArpMode {
    pub fn name(self) -> &'static str {
        match self {
            ArpMode::Up => "up",
            ArpMode::Down => "down",
            ArpMode::UpDown => "up-down",
            ArpMode::DownUp => "down-up",
            ArpMode::Played => "played",
            ArpMode::Random => "random",
        }
    }

    pub fn next(self) -> ArpMode {
        match self {
            ArpMode::Up => ArpMode::Down,
            ArpMode::Down => ArpMode::UpDown,
            ArpMode::UpDown => ArpMode::DownUp,
            ArpMode::DownUp => ArpMode::Played,
            ArpMode::Played => ArpMode::Random,
            ArpMode::Random => ArpMode::Up,
        }
    }
}

const DEFAULT_GATE: f64 = 0.3;

/// Cycles through a held note set one note per beat step, with optional
/// octave extension and per-step probability.
pub struct Arpeggiator {
    timer: Timer,
    mode: ArpMode,
    octaves: i8,
    probability: f32,
    raw_notes: Vec<Note>,
    notes: Vec<Note>,
    pos: usize,
    restart: bool,
}

impl Arpeggiator {
    pub fn new(bpm: f64) -> Self {
        Self {
            timer: Timer::new(bpm, StepDivision::Eighth.steps_per_beat(), DEFAULT_GATE),
            mode: ArpMode::Up,
            octaves: 0,
            probability: 1.0,
            raw_notes: Vec::new(),
            notes: Vec::new(),
            pos: 0,
            restart: true,
        }
    }

    pub fn mode(&self) -> ArpMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ArpMode) {
        self.mode = mode;
        self.resequence();
    }

    pub fn octaves(&self) -> i8 {
        self.octaves
    }

    /// Octave range to extend the pattern over. Positive extends upward,
    /// negative downward, zero plays the held notes as-is.
    pub fn set_octaves(&mut self, octaves: i8) {
        self.octaves = octaves;
        self.resequence();
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn set_probability(&mut self, probability: f32) {
        self.probability = probability.clamp(0.0, 1.0);
    }

    pub fn is_enabled(&self) -> bool {
        self.timer.is_enabled()
    }

    /// Replaces the note set. Octave extension and mode ordering are applied
    /// up front so the per-step work is a single index. When the set goes
    /// from empty to non-empty the cycle restarts at its first note on the
    /// next step, which fires immediately; updates to an already sounding
    /// set keep the cycle position.
    pub fn update_notes(&mut self, notes: Vec<Note>) {
        let was_empty = self.notes.is_empty();
        self.raw_notes = notes.clone();
        self.notes = sequence(notes, self.mode, self.octaves);
        if self.notes.is_empty() {
            return;
        }
        if was_empty {
            self.restart = true;
            self.timer.rearm();
        } else if self.pos >= self.notes.len() {
            self.pos = self.notes.len() - 1;
        }
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    fn resequence(&mut self) {
        if !self.notes.is_empty() {
            self.notes = sequence(self.raw_notes.clone(), self.mode, self.octaves);
            if self.pos >= self.notes.len() {
                self.pos = self.notes.len() - 1;
            }
        }
    }
}

impl Device for Arpeggiator {
    fn timer(&self) -> &Timer {
        &self.timer
    }

    fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }

    fn advance(&mut self) {
        if self.notes.is_empty() {
            return;
        }
        if self.probability < 1.0 {
            if self.probability <= 0.0 || rand::thread_rng().gen::<f32>() > self.probability {
                return;
            }
        }
        self.pos = match self.mode {
            ArpMode::Random => rand::thread_rng().gen_range(0..self.notes.len()),
            _ if self.restart => 0,
            _ => (self.pos + 1) % self.notes.len(),
        };
        self.restart = false;
        let note = &self.notes[self.pos];
        let (pitch, velocity) = (note.notenum, note.velocity);
        self.timer.press(pitch, velocity);
    }

    fn position(&self) -> usize {
        self.pos
    }
}

/// Expands `notes` over the octave range, then orders them for `mode`.
/// Transposed copies that leave the pitch range are dropped.
fn sequence(mut notes: Vec<Note>, mode: ArpMode, octaves: i8) -> Vec<Note> {
    if octaves != 0 {
        let base = notes.clone();
        let sign: i16 = if octaves > 0 { 1 } else { -1 };
        for octave in 1..=octaves.unsigned_abs() as i16 {
            for note in &base {
                if let Some(shifted) = note.transposed(sign * octave * 12) {
                    notes.push(shifted);
                }
            }
        }
    }
    match mode {
        ArpMode::Up => notes.sort(),
        ArpMode::Down => {
            notes.sort();
            notes.reverse();
        }
        ArpMode::UpDown => {
            notes.sort();
            append_mirror(&mut notes);
        }
        ArpMode::DownUp => {
            notes.sort();
            notes.reverse();
            append_mirror(&mut notes);
        }
        ArpMode::Played | ArpMode::Random => {}
    }
    notes
}

/// Appends the interior of the sequence in reverse, turning an up (or down)
/// run into a full sweep without repeating the endpoints.
fn append_mirror(notes: &mut Vec<Note>) {
    if notes.len() > 2 {
        let interior: Vec<Note> = notes[1..notes.len() - 1].to_vec();
        notes.extend(interior.into_iter().rev());
    }
}
