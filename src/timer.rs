use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Named beat divisions, expressed as steps per beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDivision {
    Whole,
    Half,
    Quarter,
    DottedQuarter,
    Eighth,
    Triplet,
    Sixteenth,
    ThirtySecond,
}

impl StepDivision {
    pub fn steps_per_beat(self) -> f64 {
        match self {
            StepDivision::Whole => 0.25,
            StepDivision::Half => 0.5,
            StepDivision::Quarter => 1.0,
            StepDivision::DottedQuarter => 1.5,
            StepDivision::Eighth => 2.0,
            StepDivision::Triplet => 3.0,
            StepDivision::Sixteenth => 4.0,
            StepDivision::ThirtySecond => 8.0,
        }
    }
}

/// Smallest allowed beat subdivision (a whole note).
pub const MIN_STEPS: f64 = 0.25;

const MIN_BPM: f64 = 1.0;
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Scheduled event emitted by a timer-driven device. Events are delivered in
/// the order they occur within a beat step: presses, then the step marker,
/// then gate-timed releases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerEvent {
    Enabled(bool),
    Step(usize),
    Press { pitch: u8, velocity: f32 },
    Release { pitch: u8 },
}

type EnabledFn = Box<dyn FnMut(bool) + Send>;
type StepFn = Box<dyn FnMut(usize) + Send>;
type PressFn = Box<dyn FnMut(u8, f32) + Send>;
type ReleaseFn = Box<dyn FnMut(u8) + Send>;

#[derive(Default)]
struct Handlers {
    enabled: Option<EnabledFn>,
    step: Option<StepFn>,
    press: Option<PressFn>,
    release: Option<ReleaseFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Step,
    Release,
}

/// Beat-synchronized scheduling core shared by the arpeggiator and the
/// sequencer.
///
/// Pacing is additive: every deadline is the previous deadline plus an exact
/// step (or gate) duration, never "now plus a duration". Jitter in any one
/// sleep therefore never accumulates into tempo drift; the long-run step rate
/// stays locked to `bpm`.
pub struct Timer {
    bpm: f64,
    steps: f64,
    gate: f64,
    step_time: Duration,
    gate_duration: Duration,
    requested: Arc<AtomicBool>,
    running: bool,
    step_at: Option<Instant>,
    release_at: Option<Instant>,
    last_press: Vec<u8>,
    handlers: Handlers,
    events: Vec<TimerEvent>,
}

impl Timer {
    pub fn new(bpm: f64, steps: f64, gate: f64) -> Self {
        let mut timer = Self {
            bpm: bpm.max(MIN_BPM),
            steps: steps.max(MIN_STEPS),
            gate: gate.clamp(0.0, 1.0),
            step_time: Duration::ZERO,
            gate_duration: Duration::ZERO,
            requested: Arc::new(AtomicBool::new(false)),
            running: false,
            step_at: None,
            release_at: None,
            last_press: Vec::new(),
            handlers: Handlers::default(),
            events: Vec::new(),
        };
        timer.retime();
        timer
    }

    fn retime(&mut self) {
        self.step_time = Duration::from_secs_f64(60.0 / self.bpm / self.steps);
        self.gate_duration = self.step_time.mul_f64(self.gate);
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, value: f64) {
        self.bpm = value.max(MIN_BPM);
        self.retime();
    }

    pub fn steps(&self) -> f64 {
        self.steps
    }

    pub fn set_steps(&mut self, value: f64) {
        self.steps = value.max(MIN_STEPS);
        self.retime();
    }

    pub fn set_division(&mut self, division: StepDivision) {
        self.set_steps(division.steps_per_beat());
    }

    pub fn gate(&self) -> f64 {
        self.gate
    }

    pub fn set_gate(&mut self, value: f64) {
        self.gate = value.clamp(0.0, 1.0);
        self.retime();
    }

    pub fn step_time(&self) -> Duration {
        self.step_time
    }

    pub fn gate_duration(&self) -> Duration {
        self.gate_duration
    }

    pub fn is_enabled(&self) -> bool {
        self.running
    }

    /// Cloneable switch for this timer, for stopping or starting a blocking
    /// `run()` loop from another thread. The loop applies the request at its
    /// next wakeup.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            requested: self.requested.clone(),
        }
    }

    /// Starts the scheduler. The first step fires immediately rather than a
    /// full step later. Returns the events emitted by the transition.
    pub fn enable(&mut self) -> Vec<TimerEvent> {
        self.enable_at(Instant::now())
    }

    pub(crate) fn enable_at(&mut self, now: Instant) -> Vec<TimerEvent> {
        self.requested.store(true, Ordering::Relaxed);
        if !self.running {
            self.running = true;
            self.step_at = Some(now);
            self.release_at = None;
            self.emit(TimerEvent::Enabled(true));
        }
        self.take_events()
    }

    /// Stops the scheduler, releasing any open notes before the disabled
    /// notification. The release is immediate; there is no grace period.
    pub fn disable(&mut self) -> Vec<TimerEvent> {
        self.requested.store(false, Ordering::Relaxed);
        if self.running {
            self.running = false;
            self.release_open();
            self.step_at = None;
            self.release_at = None;
            self.emit(TimerEvent::Enabled(false));
        }
        self.take_events()
    }

    pub fn set_enabled(&mut self, value: bool) -> Vec<TimerEvent> {
        if value {
            self.enable()
        } else {
            self.disable()
        }
    }

    pub fn toggle(&mut self) -> Vec<TimerEvent> {
        if self.running {
            self.disable()
        } else {
            self.enable()
        }
    }

    pub fn on_enabled(&mut self, callback: impl FnMut(bool) + Send + 'static) {
        self.handlers.enabled = Some(Box::new(callback));
    }

    pub fn on_step(&mut self, callback: impl FnMut(usize) + Send + 'static) {
        self.handlers.step = Some(Box::new(callback));
    }

    pub fn on_press(&mut self, callback: impl FnMut(u8, f32) + Send + 'static) {
        self.handlers.press = Some(Box::new(callback));
    }

    pub fn on_release(&mut self, callback: impl FnMut(u8) + Send + 'static) {
        self.handlers.release = Some(Box::new(callback));
    }

    /// Records a scheduled note-on. Normally called from a device's `advance`
    /// hook; the pitch stays open until the gate elapses or the timer is
    /// disabled.
    pub fn press(&mut self, pitch: u8, velocity: f32) {
        self.last_press.push(pitch);
        self.emit(TimerEvent::Press { pitch, velocity });
    }

    /// Re-arms the step deadline so the next step fires immediately. Used by
    /// devices when their note set transitions from empty to non-empty.
    pub(crate) fn rearm(&mut self) {
        if self.running {
            self.step_at = Some(Instant::now());
        }
    }

    pub(crate) fn release_open(&mut self) {
        let open = std::mem::take(&mut self.last_press);
        for pitch in open {
            self.emit(TimerEvent::Release { pitch });
        }
        self.release_at = None;
    }

    pub(crate) fn phase(&self, now: Instant) -> Phase {
        if !self.running {
            return Phase::Idle;
        }
        if let Some(at) = self.release_at {
            return if now >= at { Phase::Release } else { Phase::Idle };
        }
        match self.step_at {
            Some(at) if now >= at => Phase::Step,
            _ => Phase::Idle,
        }
    }

    /// Completes a step after the device has pressed its notes: fires the
    /// step event and schedules the gate release and the next step deadline.
    pub(crate) fn complete_step(&mut self, position: usize) {
        self.emit(TimerEvent::Step(position));
        if let Some(at) = self.step_at {
            if !self.last_press.is_empty() {
                self.release_at = Some(at + self.gate_duration);
            }
            self.step_at = Some(at + self.step_time);
        }
    }

    /// Applies a pending request from a `TimerHandle`.
    pub(crate) fn sync(&mut self, now: Instant) -> Vec<TimerEvent> {
        let want = self.requested.load(Ordering::Relaxed);
        if want == self.running {
            return Vec::new();
        }
        if want {
            self.enable_at(now)
        } else {
            self.disable()
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        self.release_at.or(self.step_at)
    }

    fn emit(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Enabled(value) => {
                if let Some(callback) = &mut self.handlers.enabled {
                    callback(value);
                }
            }
            TimerEvent::Step(position) => {
                if let Some(callback) = &mut self.handlers.step {
                    callback(position);
                }
            }
            TimerEvent::Press { pitch, velocity } => {
                if let Some(callback) = &mut self.handlers.press {
                    callback(pitch, velocity);
                }
            }
            TimerEvent::Release { pitch } => {
                if let Some(callback) = &mut self.handlers.release {
                    callback(pitch);
                }
            }
        }
        self.events.push(event);
    }

    pub(crate) fn take_events(&mut self) -> Vec<TimerEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Remote on/off switch for a timer driven by a blocking loop.
#[derive(Clone)]
pub struct TimerHandle {
    requested: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn enable(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.requested.store(false, Ordering::Relaxed);
    }

    pub fn toggle(&self) {
        self.requested.fetch_xor(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

/// A timer-driven note source. The arpeggiator and the sequencer implement
/// the per-step hook; the trait supplies the two drive modes.
pub trait Device {
    fn timer(&self) -> &Timer;

    fn timer_mut(&mut self) -> &mut Timer;

    /// Produces this step's presses.
    fn advance(&mut self);

    /// Position reported with step events.
    fn position(&self) -> usize {
        0
    }

    /// Processes every phase due at `now` without blocking and returns the
    /// emitted events in order. Registered handlers fire as usual. Catch-up
    /// is exact: if `now` is several steps past the cursor, each missed step
    /// runs and the cursor still lands on a whole-step boundary.
    fn drive(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut events = self.timer_mut().sync(now);
        loop {
            match self.timer().phase(now) {
                Phase::Release => self.timer_mut().release_open(),
                Phase::Step => {
                    self.advance();
                    let position = self.position();
                    self.timer_mut().complete_step(position);
                }
                Phase::Idle => break,
            }
        }
        events.extend(self.timer_mut().take_events());
        events
    }

    /// Non-blocking drive against the wall clock. Suitable for calling from
    /// an application's own tick loop.
    fn service(&mut self) -> Vec<TimerEvent> {
        self.drive(Instant::now())
    }

    /// Blocking scheduler loop. Idles while the timer is disabled, otherwise
    /// sleeps to each deadline and runs the due phase. Enable and disable the
    /// timer through a `TimerHandle`; the loop itself never returns.
    fn run(&mut self) -> ! {
        loop {
            let now = Instant::now();
            self.timer_mut().sync(now);
            match self.timer().next_deadline() {
                None => thread::sleep(IDLE_POLL),
                Some(deadline) => {
                    thread::sleep(deadline.saturating_duration_since(now));
                    self.drive(deadline);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Metronome {
        timer: Timer,
        pitch: u8,
    }

    impl Metronome {
        fn new(bpm: f64, steps: f64, gate: f64) -> Self {
            Self {
                timer: Timer::new(bpm, steps, gate),
                pitch: 60,
            }
        }
    }

    impl Device for Metronome {
        fn timer(&self) -> &Timer {
            &self.timer
        }

        fn timer_mut(&mut self) -> &mut Timer {
            &mut self.timer
        }

        fn advance(&mut self) {
            let pitch = self.pitch;
            self.timer.press(pitch, 1.0);
        }
    }

    #[test]
    fn input_clamping() {
        let timer = Timer::new(0.0, 0.0, 7.0);
        assert_eq!(timer.bpm(), 1.0);
        assert_eq!(timer.steps(), MIN_STEPS);
        assert_eq!(timer.gate(), 1.0);

        let mut timer = Timer::new(120.0, 2.0, 0.5);
        timer.set_gate(-1.0);
        assert_eq!(timer.gate(), 0.0);
        timer.set_steps(0.1);
        assert_eq!(timer.steps(), MIN_STEPS);
    }

    #[test]
    fn derived_timing() {
        let timer = Timer::new(120.0, 2.0, 0.5);
        assert_eq!(timer.step_time(), Duration::from_millis(250));
        assert_eq!(timer.gate_duration(), Duration::from_millis(125));
    }

    #[test]
    fn step_cycle_order() {
        // bpm 120, 2 steps/beat: step 250ms, gate 125ms
        let mut dev = Metronome::new(120.0, 2.0, 0.5);
        let start = Instant::now();
        let events = dev.timer_mut().enable_at(start);
        assert_eq!(events, vec![TimerEvent::Enabled(true)]);

        // first step fires with no initial wait
        let events = dev.drive(start);
        assert_eq!(
            events,
            vec![
                TimerEvent::Press {
                    pitch: 60,
                    velocity: 1.0
                },
                TimerEvent::Step(0),
            ]
        );

        // nothing due until the gate elapses
        assert!(dev.drive(start + Duration::from_millis(124)).is_empty());
        let events = dev.drive(start + Duration::from_millis(125));
        assert_eq!(events, vec![TimerEvent::Release { pitch: 60 }]);

        let events = dev.drive(start + Duration::from_millis(250));
        assert_eq!(
            events,
            vec![
                TimerEvent::Press {
                    pitch: 60,
                    velocity: 1.0
                },
                TimerEvent::Step(0),
            ]
        );
    }

    #[test]
    fn additive_pacing_is_drift_free() {
        // bpm 120, 4 steps/beat: step 125ms; zero gate so releases fire
        // within the same step.
        let mut dev = Metronome::new(120.0, 4.0, 0.0);
        let start = Instant::now();
        dev.timer_mut().enable_at(start);

        let step = Duration::from_millis(125);
        let events = dev.drive(start + step * 100);
        let presses = events
            .iter()
            .filter(|e| matches!(e, TimerEvent::Press { .. }))
            .count();
        // one immediate step plus one per elapsed boundary
        assert_eq!(presses, 101);

        // the cursor is a whole number of steps from the start, not a
        // function of when the device was last driven
        assert_eq!(dev.timer().next_deadline(), Some(start + step * 101));
    }

    #[test]
    fn disable_releases_open_notes_first() {
        let mut dev = Metronome::new(120.0, 2.0, 0.5);
        let start = Instant::now();
        dev.timer_mut().enable_at(start);
        dev.drive(start);

        let events = dev.timer_mut().disable();
        assert_eq!(
            events,
            vec![TimerEvent::Release { pitch: 60 }, TimerEvent::Enabled(false)]
        );
        assert!(!dev.timer().is_enabled());
        assert_eq!(dev.timer().next_deadline(), None);
    }

    #[test]
    fn handle_controls_timer_through_sync() {
        let mut dev = Metronome::new(120.0, 2.0, 0.5);
        let handle = dev.timer().handle();
        let start = Instant::now();

        handle.enable();
        let events = dev.drive(start);
        assert_eq!(events[0], TimerEvent::Enabled(true));
        assert!(dev.timer().is_enabled());

        handle.disable();
        let events = dev.drive(start + Duration::from_millis(1));
        assert!(events.contains(&TimerEvent::Enabled(false)));
        assert!(!dev.timer().is_enabled());
    }

    #[test]
    fn handlers_fire_alongside_events() {
        let presses = Arc::new(Mutex::new(Vec::new()));
        let releases = Arc::new(Mutex::new(Vec::new()));

        let mut dev = Metronome::new(120.0, 2.0, 0.5);
        let log = presses.clone();
        dev.timer_mut()
            .on_press(move |pitch, _velocity| log.lock().unwrap().push(pitch));
        let log = releases.clone();
        dev.timer_mut()
            .on_release(move |pitch| log.lock().unwrap().push(pitch));

        let start = Instant::now();
        dev.timer_mut().enable_at(start);
        dev.drive(start);
        dev.drive(start + Duration::from_millis(125));

        assert_eq!(*presses.lock().unwrap(), vec![60]);
        assert_eq!(*releases.lock().unwrap(), vec![60]);
    }

    #[test]
    fn full_gate_releases_before_next_step() {
        let mut dev = Metronome::new(120.0, 2.0, 1.0);
        let start = Instant::now();
        dev.timer_mut().enable_at(start);
        dev.drive(start);

        // release deadline coincides with the next step; release comes first
        let events = dev.drive(start + Duration::from_millis(250));
        assert_eq!(events[0], TimerEvent::Release { pitch: 60 });
        assert_eq!(
            events[1],
            TimerEvent::Press {
                pitch: 60,
                velocity: 1.0
            }
        );
    }
}
