use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::arp::Arpeggiator;
use crate::note::{self, Note};
use crate::timer::{Device, TimerEvent};
use crate::voice::Voice;

/// Which notes win the voices when more are held than can sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotePriority {
    High,
    Low,
    Last,
}

/// Edge read from a physical key since the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    None,
    Press,
    Release,
}

/// A pollable key. `state` reports the edge since the previous call, not the
/// level, so a held key yields one press.
pub trait Key: Send {
    fn state(&mut self) -> KeyState;

    fn velocity(&self) -> f32 {
        1.0
    }
}

pub const DEFAULT_ROOT: u8 = 48;

type VoiceFn = Box<dyn FnMut(&Voice) + Send>;
type KeyPressFn = Box<dyn FnMut(usize, u8, f32) + Send>;
type KeyReleaseFn = Box<dyn FnMut(usize, u8) + Send>;

#[derive(Default)]
struct Handlers {
    voice_press: Option<VoiceFn>,
    voice_release: Option<VoiceFn>,
    key_press: Option<KeyPressFn>,
    key_release: Option<KeyReleaseFn>,
}

/// Note buffer and voice allocator. Incoming presses are deduplicated by
/// pitch, filtered by priority against the voice budget and mapped onto
/// voices; an attached arpeggiator takes over the mapping when enabled.
pub struct Keyboard {
    keys: Vec<Box<dyn Key>>,
    root: u8,
    mode: NotePriority,
    max_voices: usize,
    notes: Vec<Arc<Note>>,
    sustained: Vec<Arc<Note>>,
    sustain: bool,
    voices: Vec<Voice>,
    arpeggiator: Option<Arpeggiator>,
    handlers: Handlers,
}

impl Keyboard {
    pub fn new(max_voices: usize) -> Self {
        Self::with_keys(Vec::new(), max_voices, DEFAULT_ROOT, NotePriority::High)
    }

    pub fn with_keys(
        keys: Vec<Box<dyn Key>>,
        max_voices: usize,
        root: u8,
        mode: NotePriority,
    ) -> Self {
        let max_voices = max_voices.max(1);
        Self {
            keys,
            root,
            mode,
            max_voices,
            notes: Vec::new(),
            sustained: Vec::new(),
            sustain: false,
            voices: (0..max_voices).map(Voice::new).collect(),
            arpeggiator: None,
            handlers: Handlers::default(),
        }
    }

    pub fn on_voice_press(&mut self, callback: impl FnMut(&Voice) + Send + 'static) {
        self.handlers.voice_press = Some(Box::new(callback));
    }

    pub fn on_voice_release(&mut self, callback: impl FnMut(&Voice) + Send + 'static) {
        self.handlers.voice_release = Some(Box::new(callback));
    }

    pub fn on_key_press(&mut self, callback: impl FnMut(usize, u8, f32) + Send + 'static) {
        self.handlers.key_press = Some(Box::new(callback));
    }

    pub fn on_key_release(&mut self, callback: impl FnMut(usize, u8) + Send + 'static) {
        self.handlers.key_release = Some(Box::new(callback));
    }

    pub fn root(&self) -> u8 {
        self.root
    }

    pub fn set_root(&mut self, root: u8) {
        self.root = root;
    }

    pub fn mode(&self) -> NotePriority {
        self.mode
    }

    pub fn set_mode(&mut self, mode: NotePriority) {
        self.mode = mode;
        self.refresh();
    }

    pub fn max_voices(&self) -> usize {
        self.max_voices
    }

    /// Changes the voice budget. Shrinking releases and drops the
    /// highest-indexed voices; the survivors are then refilled from the
    /// current note set under the active priority.
    pub fn set_max_voices(&mut self, max_voices: usize) {
        self.max_voices = max_voices.max(1);
        while self.voices.len() > self.max_voices {
            let mut voice = self.voices.pop().unwrap();
            if voice.is_active() {
                if let Some(callback) = &mut self.handlers.voice_release {
                    callback(&voice);
                }
                voice.clear();
            }
        }
        while self.voices.len() < self.max_voices {
            self.voices.push(Voice::new(self.voices.len()));
        }
        self.refresh();
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    /// Buffers a note. An existing note of the same pitch (sustained copies
    /// included) is replaced rather than duplicated.
    pub fn append(&mut self, pitch: u8, velocity: f32, keynum: Option<usize>) {
        self.strip(pitch, true);
        let note = Arc::new(Note::new(pitch, velocity, keynum));
        if self.sustain {
            self.sustained.push(note.clone());
        }
        self.notes.push(note);
        self.refresh();
    }

    /// Removes a pitch from the buffer. With sustain active the sustained
    /// copy keeps sounding unless `remove_sustained` is set. Unknown pitches
    /// are ignored.
    pub fn remove(&mut self, pitch: u8, remove_sustained: bool) {
        if !self.has_note(pitch, true) {
            return;
        }
        self.strip(pitch, remove_sustained);
        self.refresh();
    }

    fn strip(&mut self, pitch: u8, strip_sustained: bool) {
        self.notes.retain(|note| !note.matches_pitch(pitch));
        if strip_sustained && self.sustain {
            self.sustained.retain(|note| !note.matches_pitch(pitch));
        }
    }

    pub fn sustain(&self) -> bool {
        self.sustain
    }

    /// Sustain pedal. Pressing it snapshots the currently held notes; they
    /// keep sounding after their keys lift until the pedal is released.
    pub fn set_sustain(&mut self, sustain: bool) {
        if sustain == self.sustain {
            return;
        }
        self.sustain = sustain;
        self.sustained = if sustain { self.notes.clone() } else { Vec::new() };
        self.refresh();
    }

    /// The buffered notes, optionally including sustained ones no longer
    /// held. Each note appears once even when present in both lists.
    pub fn notes(&self, include_sustained: bool) -> Vec<Arc<Note>> {
        let mut notes = self.notes.clone();
        if include_sustained {
            for note in &self.sustained {
                if !notes.iter().any(|n| Arc::ptr_eq(n, note)) {
                    notes.push(note.clone());
                }
            }
        }
        notes
    }

    pub fn has_note(&self, pitch: u8, include_sustained: bool) -> bool {
        note::any_matches(&self.notes, pitch)
            || (include_sustained && note::any_matches(&self.sustained, pitch))
    }

    pub fn has_notes(&self, include_sustained: bool) -> bool {
        !self.notes.is_empty() || (include_sustained && !self.sustained.is_empty())
    }

    /// The notes entitled to voices under the current priority, at most
    /// `max_voices` of them.
    pub fn select_notes(&self) -> Vec<Arc<Note>> {
        let mut selected = self.notes(true);
        match self.mode {
            NotePriority::High => {
                selected.sort_by(|a, b| b.cmp(a));
                selected.truncate(self.max_voices);
            }
            NotePriority::Low => {
                selected.sort();
                selected.truncate(self.max_voices);
            }
            NotePriority::Last => {
                selected.sort_by_key(|note| note.timestamp);
                let keep = selected.len().saturating_sub(self.max_voices);
                selected = selected.split_off(keep);
            }
        }
        selected
    }

    pub fn attach_arpeggiator(&mut self, arpeggiator: Arpeggiator) {
        self.arpeggiator = Some(arpeggiator);
    }

    pub fn detach_arpeggiator(&mut self) -> Option<Arpeggiator> {
        self.set_arpeggiator_enabled(false);
        self.arpeggiator.take()
    }

    pub fn arpeggiator(&self) -> Option<&Arpeggiator> {
        self.arpeggiator.as_ref()
    }

    pub fn arpeggiator_mut(&mut self) -> Option<&mut Arpeggiator> {
        self.arpeggiator.as_mut()
    }

    /// Switches the attached arpeggiator's clock. Enabling hands the current
    /// note set over to it; disabling releases its voices and puts the
    /// allocator back in charge of held notes.
    pub fn set_arpeggiator_enabled(&mut self, enabled: bool) {
        let events = match self.arpeggiator.as_mut() {
            Some(arp) => arp.timer_mut().set_enabled(enabled),
            None => return,
        };
        self.apply_timer_events(&events);
        self.refresh();
    }

    /// Drives the attached arpeggiator's clock against the wall clock and
    /// routes its presses and releases through the voice allocator. Call
    /// this from the application's tick loop.
    pub fn service_arpeggiator(&mut self) {
        let events = match self.arpeggiator.as_mut() {
            Some(arp) => arp.service(),
            None => return,
        };
        self.apply_timer_events(&events);
    }

    fn apply_timer_events(&mut self, events: &[TimerEvent]) {
        for event in events {
            match *event {
                TimerEvent::Press { pitch, velocity } => {
                    let note = Arc::new(Note::new(pitch, velocity, None));
                    self.update_voices(vec![note]);
                }
                TimerEvent::Release { .. } => self.update_voices(Vec::new()),
                TimerEvent::Enabled(_) | TimerEvent::Step(_) => {}
            }
        }
    }

    /// Re-derives voice assignments from the note buffer, or feeds the note
    /// set to the arpeggiator when one is running.
    fn refresh(&mut self) {
        let arp_running = self
            .arpeggiator
            .as_ref()
            .map_or(false, |arp| arp.is_enabled());
        if arp_running {
            let notes: Vec<Note> = self
                .notes(true)
                .iter()
                .map(|note| note.as_ref().clone())
                .collect();
            if let Some(arp) = self.arpeggiator.as_mut() {
                arp.update_notes(notes);
            }
        } else {
            let selected = self.select_notes();
            self.update_voices(selected);
        }
    }

    /// Maps `candidates` onto voices. Voices whose note is no longer wanted
    /// are released oldest-first, then the remaining candidates fill inactive
    /// voices oldest-first. Matching is by note identity, so a re-pressed
    /// pitch retriggers its voice. Candidates beyond the budget are dropped.
    fn update_voices(&mut self, mut candidates: Vec<Arc<Note>>) {
        if candidates.is_empty() {
            for index in self.active_order() {
                self.release_voice(index);
            }
            return;
        }
        for index in self.active_order() {
            let held = self.voices[index].note().cloned();
            let matched = held.as_ref().and_then(|held| {
                candidates.iter().position(|note| Arc::ptr_eq(note, held))
            });
            match matched {
                Some(at) => {
                    candidates.remove(at);
                }
                None => self.release_voice(index),
            }
        }
        let free = self.inactive_order();
        for (note, index) in candidates.into_iter().zip(free) {
            self.press_voice(index, note);
        }
    }

    fn active_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = self
            .voices
            .iter()
            .filter(|voice| voice.is_active())
            .map(Voice::index)
            .collect();
        order.sort_by_key(|&index| self.voices[index].time());
        order
    }

    fn inactive_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = self
            .voices
            .iter()
            .filter(|voice| !voice.is_active())
            .map(Voice::index)
            .collect();
        order.sort_by_key(|&index| self.voices[index].time());
        order
    }

    fn press_voice(&mut self, index: usize, note: Arc<Note>) {
        self.voices[index].assign(note);
        if let Some(callback) = &mut self.handlers.voice_press {
            callback(&self.voices[index]);
        }
    }

    fn release_voice(&mut self, index: usize) {
        if !self.voices[index].is_active() {
            return;
        }
        if let Some(callback) = &mut self.handlers.voice_release {
            callback(&self.voices[index]);
        }
        self.voices[index].clear();
    }

    /// Polls every key once. Key index `i` maps to pitch `root + i`.
    pub fn update(&mut self) {
        for index in 0..self.keys.len() {
            let state = self.keys[index].state();
            let pitch = self.root.saturating_add(index as u8);
            match state {
                KeyState::Press => {
                    let velocity = self.keys[index].velocity();
                    self.append(pitch, velocity, Some(index));
                    if let Some(callback) = &mut self.handlers.key_press {
                        callback(index, pitch, velocity);
                    }
                }
                KeyState::Release => {
                    self.remove(pitch, false);
                    if let Some(callback) = &mut self.handlers.key_release {
                        callback(index, pitch);
                    }
                }
                KeyState::None => {}
            }
        }
    }

    /// Cooperative main loop: poll keys, service the arpeggiator, sleep.
    pub fn run(&mut self, poll_interval: Duration) -> ! {
        loop {
            self.update();
            self.service_arpeggiator();
            thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn active_pitches(keyboard: &Keyboard) -> Vec<u8> {
        let mut pitches: Vec<u8> = keyboard
            .voices()
            .iter()
            .filter_map(|voice| voice.note().map(|note| note.notenum))
            .collect();
        pitches.sort();
        pitches
    }

    #[test]
    fn no_duplicate_pitches_in_buffer() {
        let mut kb = Keyboard::new(4);
        kb.append(60, 1.0, None);
        kb.append(60, 0.5, None);
        assert_eq!(kb.notes(true).len(), 1);
        assert_eq!(kb.notes(true)[0].velocity, 0.5);
    }

    #[test]
    fn remove_unknown_pitch_is_a_noop() {
        let mut kb = Keyboard::new(4);
        kb.append(60, 1.0, None);
        kb.remove(61, false);
        assert_eq!(active_pitches(&kb), vec![60]);
    }

    #[test]
    fn active_voices_never_exceed_budget() {
        let mut kb = Keyboard::new(2);
        for pitch in [60, 64, 67, 72] {
            kb.append(pitch, 1.0, None);
        }
        assert_eq!(kb.voices().iter().filter(|v| v.is_active()).count(), 2);
    }

    #[test]
    fn high_priority_keeps_highest_pitches() {
        let mut kb = Keyboard::new(2);
        for pitch in [60, 64, 67] {
            kb.append(pitch, 1.0, None);
        }
        assert_eq!(active_pitches(&kb), vec![64, 67]);
    }

    #[test]
    fn low_priority_keeps_lowest_pitches() {
        let mut kb = Keyboard::new(2);
        kb.set_mode(NotePriority::Low);
        for pitch in [60, 64, 67] {
            kb.append(pitch, 1.0, None);
        }
        assert_eq!(active_pitches(&kb), vec![60, 64]);
    }

    #[test]
    fn last_priority_keeps_most_recent() {
        let mut kb = Keyboard::new(2);
        kb.set_mode(NotePriority::Last);
        for pitch in [60, 64, 67] {
            kb.append(pitch, 1.0, None);
        }
        kb.remove(64, false);
        kb.append(70, 1.0, None);
        assert_eq!(active_pitches(&kb), vec![67, 70]);
    }

    #[test]
    fn append_then_remove_restores_allocation() {
        let mut kb = Keyboard::new(2);
        kb.append(60, 1.0, None);
        kb.append(64, 1.0, None);
        let before: Vec<Option<u8>> = kb
            .voices()
            .iter()
            .map(|v| v.note().map(|n| n.notenum))
            .collect();

        kb.append(67, 1.0, None);
        kb.remove(67, false);

        let after: Vec<Option<u8>> = kb
            .voices()
            .iter()
            .map(|v| v.note().map(|n| n.notenum))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn releasing_a_winner_promotes_a_loser() {
        let mut kb = Keyboard::new(2);
        for pitch in [60, 64, 67] {
            kb.append(pitch, 1.0, None);
        }
        kb.remove(67, false);
        assert_eq!(active_pitches(&kb), vec![60, 64]);
    }

    #[test]
    fn surviving_notes_keep_their_voices() {
        let mut kb = Keyboard::new(4);
        kb.append(60, 1.0, None);
        let held_at = kb.voices()[0].time();
        kb.append(64, 1.0, None);
        // the voice holding 60 was not retriggered
        assert!(kb.voices()[0].holds_pitch(60));
        assert_eq!(kb.voices()[0].time(), held_at);
        assert!(kb.voices()[1].holds_pitch(64));
    }

    #[test]
    fn sustain_holds_released_notes() {
        let mut kb = Keyboard::new(4);
        kb.append(60, 1.0, None);
        kb.set_sustain(true);
        kb.remove(60, false);
        assert_eq!(active_pitches(&kb), vec![60]);
        assert!(!kb.has_note(60, false));
        assert!(kb.has_note(60, true));

        kb.set_sustain(false);
        assert_eq!(active_pitches(&kb), Vec::<u8>::new());
    }

    #[test]
    fn sustained_note_can_be_removed_explicitly() {
        let mut kb = Keyboard::new(4);
        kb.append(60, 1.0, None);
        kb.set_sustain(true);
        kb.remove(60, true);
        assert_eq!(active_pitches(&kb), Vec::<u8>::new());
    }

    #[test]
    fn repress_during_sustain_does_not_double_allocate() {
        let mut kb = Keyboard::new(4);
        kb.append(60, 1.0, None);
        kb.set_sustain(true);
        kb.remove(60, false);
        kb.append(60, 1.0, None);
        assert_eq!(active_pitches(&kb), vec![60]);
    }

    #[test]
    fn shrinking_voice_budget_releases_excess() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let mut kb = Keyboard::new(4);
        let log = released.clone();
        kb.on_voice_release(move |voice| {
            if let Some(note) = voice.note() {
                log.lock().unwrap().push(note.notenum);
            }
        });
        for pitch in [60, 64, 67] {
            kb.append(pitch, 1.0, None);
        }
        kb.set_max_voices(2);
        assert_eq!(kb.voices().len(), 2);
        assert_eq!(active_pitches(&kb).len(), 2);
        assert!(!released.lock().unwrap().is_empty());

        kb.set_max_voices(4);
        assert_eq!(kb.voices().len(), 4);
        // the refreshed selection re-seats all three held notes
        assert_eq!(active_pitches(&kb), vec![60, 64, 67]);
    }

    #[test]
    fn voice_handlers_fire_on_press_and_release() {
        let pressed = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(Mutex::new(Vec::new()));
        let mut kb = Keyboard::new(2);
        let log = pressed.clone();
        kb.on_voice_press(move |voice| {
            if let Some(note) = voice.note() {
                log.lock().unwrap().push(note.notenum);
            }
        });
        let log = released.clone();
        kb.on_voice_release(move |voice| {
            if let Some(note) = voice.note() {
                log.lock().unwrap().push(note.notenum);
            }
        });

        kb.append(60, 1.0, None);
        kb.remove(60, false);
        assert_eq!(*pressed.lock().unwrap(), vec![60]);
        assert_eq!(*released.lock().unwrap(), vec![60]);
    }

    struct ScriptedKey {
        states: Vec<KeyState>,
    }

    impl Key for ScriptedKey {
        fn state(&mut self) -> KeyState {
            if self.states.is_empty() {
                KeyState::None
            } else {
                self.states.remove(0)
            }
        }
    }

    #[test]
    fn polling_keys_maps_index_to_pitch() {
        let keys: Vec<Box<dyn Key>> = vec![
            Box::new(ScriptedKey {
                states: vec![KeyState::Press, KeyState::Release],
            }),
            Box::new(ScriptedKey {
                states: vec![KeyState::None, KeyState::Press],
            }),
        ];
        let mut kb = Keyboard::with_keys(keys, 4, 60, NotePriority::High);

        kb.update();
        assert_eq!(active_pitches(&kb), vec![60]);
        kb.update();
        assert_eq!(active_pitches(&kb), vec![61]);
    }

    #[test]
    fn enabled_arpeggiator_takes_over_allocation() {
        let mut kb = Keyboard::new(4);
        kb.attach_arpeggiator(Arpeggiator::new(120.0));
        kb.set_arpeggiator_enabled(true);

        kb.append(60, 1.0, None);
        kb.append(64, 1.0, None);
        // held notes go to the arpeggiator, not straight to voices
        assert_eq!(active_pitches(&kb), Vec::<u8>::new());
        assert_eq!(kb.arpeggiator().unwrap().notes().len(), 2);

        // the first serviced step sounds the first pattern note
        let now = Instant::now();
        let events = kb.arpeggiator_mut().unwrap().drive(now);
        kb.apply_timer_events(&events);
        assert_eq!(active_pitches(&kb), vec![60]);
    }

    #[test]
    fn disabling_arpeggiator_restores_held_notes() {
        let mut kb = Keyboard::new(4);
        kb.attach_arpeggiator(Arpeggiator::new(120.0));
        kb.set_arpeggiator_enabled(true);
        kb.append(60, 1.0, None);
        kb.append(64, 1.0, None);

        kb.set_arpeggiator_enabled(false);
        assert_eq!(active_pitches(&kb), vec![60, 64]);
    }

    #[test]
    fn detach_disables_first() {
        let mut kb = Keyboard::new(4);
        kb.attach_arpeggiator(Arpeggiator::new(120.0));
        kb.set_arpeggiator_enabled(true);
        let arp = kb.detach_arpeggiator().unwrap();
        assert!(!arp.is_enabled());
        assert!(kb.arpeggiator().is_none());
    }
}
