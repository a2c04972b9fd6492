use std::sync::Arc;
use std::time::Instant;

use crate::note::Note;

/// One sound-generation slot. A voice holds at most one note; `time` records
/// the last assignment so the allocator can visit voices oldest-first.
#[derive(Debug)]
pub struct Voice {
    index: usize,
    note: Option<Arc<Note>>,
    time: Instant,
}

impl Voice {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            note: None,
            time: Instant::now(),
        }
    }

    /// Fixed position of this voice in the keyboard's voice array. This is
    /// the only integer identity a voice has; pitch lookup goes through the
    /// held note.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn note(&self) -> Option<&Arc<Note>> {
        self.note.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.note.is_some()
    }

    pub fn holds_pitch(&self, pitch: u8) -> bool {
        self.note.as_ref().map_or(false, |note| note.matches_pitch(pitch))
    }

    pub fn time(&self) -> Instant {
        self.time
    }

    pub(crate) fn assign(&mut self, note: Arc<Note>) {
        self.note = Some(note);
        self.time = Instant::now();
    }

    pub(crate) fn clear(&mut self) {
        self.note = None;
    }
}
