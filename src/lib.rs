pub mod app;
pub mod arp;
pub mod keyboard;
pub mod note;
pub mod seq;
pub mod timer;
pub mod view;
pub mod voice;

pub use arp::{ArpMode, Arpeggiator};
pub use keyboard::{Key, KeyState, Keyboard, NotePriority};
pub use note::Note;
pub use seq::{SeqNote, Sequencer};
pub use timer::{Device, StepDivision, Timer, TimerEvent, TimerHandle};
pub use voice::Voice;
