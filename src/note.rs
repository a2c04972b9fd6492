use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// A single sounding pitch request.
///
/// Notes are immutable once created. Equality and ordering consider the pitch
/// only; the allocator ties a note to the voice playing it by `Arc` identity,
/// never by pitch value, so the same pitch can be released and re-pressed
/// without confusing the two generations.
#[derive(Debug, Clone)]
pub struct Note {
    pub notenum: u8,
    pub velocity: f32,
    pub keynum: Option<usize>,
    pub timestamp: Instant,
}

impl Note {
    pub fn new(notenum: u8, velocity: f32, keynum: Option<usize>) -> Self {
        Self {
            notenum,
            velocity: velocity.clamp(0.0, 1.0),
            keynum,
            timestamp: Instant::now(),
        }
    }

    pub fn matches_pitch(&self, pitch: u8) -> bool {
        self.notenum == pitch
    }

    /// Copy of this note shifted by `semitones`, or `None` when the result
    /// leaves the 0..=127 pitch range.
    pub fn transposed(&self, semitones: i16) -> Option<Note> {
        let pitch = self.notenum as i16 + semitones;
        if (0..=127).contains(&pitch) {
            Some(Note {
                notenum: pitch as u8,
                velocity: self.velocity,
                keynum: None,
                timestamp: self.timestamp,
            })
        } else {
            None
        }
    }
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.notenum == other.notenum
    }
}

impl Eq for Note {}

impl PartialOrd for Note {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Note {
    fn cmp(&self, other: &Self) -> Ordering {
        self.notenum.cmp(&other.notenum)
    }
}

/// True if any note in the slice has the given pitch.
pub fn any_matches(notes: &[Arc<Note>], pitch: u8) -> bool {
    notes.iter().any(|note| note.matches_pitch(pitch))
}
