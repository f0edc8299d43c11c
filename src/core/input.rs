use log::debug;
use smallvec::SmallVec;

use crate::game::session::{LANE_COUNT, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputEvent {
    pub lane: usize,
    pub pressed: bool,
}

impl InputEvent {
    pub const fn press(lane: usize) -> Self {
        Self { lane, pressed: true }
    }

    pub const fn release(lane: usize) -> Self {
        Self { lane, pressed: false }
    }
}

pub type InputBatch = SmallVec<[InputEvent; 4]>;

/// Anything that produces lane edges once per frame: a keyboard bridge, a
/// replay, or the built-in autoplayer.
pub trait InputSource {
    fn poll(&mut self, session: &Session, now_ms: f64) -> InputBatch;
}

/// Presses every note the moment it is due and releases on the next poll.
/// `miss_every` lets it skip every n-th note on purpose.
#[derive(Debug, Default)]
pub struct Autoplay {
    enabled: bool,
    cursor: usize,
    notes_version: u32,
    held: [bool; LANE_COUNT],
    miss_every: Option<u32>,
    seen: u32,
}

impl Autoplay {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn sloppy(miss_every: u32) -> Self {
        Self {
            miss_every: (miss_every > 0).then_some(miss_every),
            ..Self::new()
        }
    }

    /// 0 = never presses, 1 = perfect, N >= 2 = drops every N-th note.
    pub fn from_setting(setting: u32) -> Self {
        match setting {
            0 => Self::default(),
            1 => Self::new(),
            n => Self::sloppy(n),
        }
    }
}

impl InputSource for Autoplay {
    fn poll(&mut self, session: &Session, now_ms: f64) -> InputBatch {
        let mut events = InputBatch::new();
        if !self.enabled {
            return events;
        }
        for (lane, held) in self.held.iter_mut().enumerate() {
            if *held {
                *held = false;
                events.push(InputEvent::release(lane));
            }
        }

        if session.notes_version != self.notes_version {
            debug!("Autoplay: new chart (version {})", session.notes_version);
            self.notes_version = session.notes_version;
            self.cursor = 0;
        }

        let notes = &session.notes;
        while let Some(note) = notes.get(self.cursor)
            && note.time <= now_ms
        {
            self.cursor += 1;
            if note.is_terminal() || note.lane_index >= LANE_COUNT {
                continue;
            }
            self.seen += 1;
            if self.miss_every.is_some_and(|n| self.seen % n == 0) {
                continue;
            }
            if !self.held[note.lane_index] {
                self.held[note.lane_index] = true;
                events.push(InputEvent::press(note.lane_index));
            }
        }
        events
    }
}
