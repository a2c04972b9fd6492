use crate::timer::{Device, StepDivision, Timer};

const DEFAULT_GATE: f64 = 0.5;

/// One programmed grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeqNote {
    pub pitch: u8,
    pub velocity: f32,
}

impl SeqNote {
    /// A cell with no audible pitch or no level is treated as a rest.
    pub fn is_rest(&self) -> bool {
        self.pitch == 0 || self.velocity <= 0.0
    }
}

/// Fixed-length step grid, one row of cells per track. Every track's cell at
/// the current position is pressed on each sixteenth-note step.
pub struct Sequencer {
    timer: Timer,
    length: usize,
    data: Vec<Vec<Option<SeqNote>>>,
    pos: usize,
}

impl Sequencer {
    pub fn new(length: usize, tracks: usize, bpm: f64) -> Self {
        let length = length.max(1);
        let tracks = tracks.max(1);
        Self {
            timer: Timer::new(bpm, StepDivision::Sixteenth.steps_per_beat(), DEFAULT_GATE),
            length,
            data: vec![vec![None; length]; tracks],
            pos: 0,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Resizes every track, truncating or padding with rests. The playback
    /// position is left alone; it wraps into range on the next step.
    pub fn set_length(&mut self, length: usize) {
        self.length = length.max(1);
        for track in &mut self.data {
            track.resize(self.length, None);
        }
    }

    pub fn tracks(&self) -> usize {
        self.data.len()
    }

    pub fn set_tracks(&mut self, tracks: usize) {
        let length = self.length;
        self.data.resize_with(tracks.max(1), || vec![None; length]);
    }

    pub fn set_note(&mut self, position: usize, pitch: u8, velocity: f32, track: usize) {
        let (position, track) = self.clamp_cell(position, track);
        self.data[track][position] = Some(SeqNote {
            pitch,
            velocity: velocity.clamp(0.0, 1.0),
        });
    }

    pub fn get_note(&self, position: usize, track: usize) -> Option<SeqNote> {
        let (position, track) = self.clamp_cell(position, track);
        self.data[track][position]
    }

    pub fn has_note(&self, position: usize, track: usize) -> bool {
        self.get_note(position, track).is_some()
    }

    pub fn remove_note(&mut self, position: usize, track: usize) {
        let (position, track) = self.clamp_cell(position, track);
        self.data[track][position] = None;
    }

    pub fn get_track(&self, track: usize) -> Option<&[Option<SeqNote>]> {
        self.data.get(track).map(|cells| cells.as_slice())
    }

    fn clamp_cell(&self, position: usize, track: usize) -> (usize, usize) {
        (position.min(self.length - 1), track.min(self.data.len() - 1))
    }
}

impl Device for Sequencer {
    fn timer(&self) -> &Timer {
        &self.timer
    }

    fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }

    fn advance(&mut self) {
        self.pos = (self.pos + 1) % self.length;
        for track in &self.data {
            if let Some(note) = track[self.pos] {
                if !note.is_rest() {
                    self.timer.press(note.pitch, note.velocity);
                }
            }
        }
    }

    fn position(&self) -> usize {
        self.pos
    }
}
