//! Combination recognizer
//!
//! Turns logical button transitions into actions. Concurrent chords fire when
//! all their buttons are held within the chord gap, longest match first.
//! Ordered chords are recognized as sequences of presses, each within the gap
//! of the previous one. Buttons that turn out not to be part of a chord are
//! reported late, as a press or as a tap, if they are passthrough buttons.
//!
//! The recognizer is a plain state machine driven by event timestamps. The
//! engine asks for [`Recognizer::next_deadline`] and calls
//! [`Recognizer::advance`] when it passes.

use handycon_common::{tracing, Action, LogicalButton, Phase, SourceId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::event::LogicalEvent;
use crate::quirks::{ChordDefinition, ChordKind, QuirkProfile};

/// Externally visible state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerPhase {
    Idle,
    Holding,
    SequencePending,
}

impl fmt::Display for RecognizerPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RecognizerPhase::Idle => "idle",
            RecognizerPhase::Holding => "holding",
            RecognizerPhase::SequencePending => "sequence_pending",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Withheld while a chord may still claim it
    Pending,
    /// Press forwarded to the sink
    Reported,
    /// Claimed by a fired chord
    Consumed,
    /// Neither forwarded nor claimed
    Silent,
}

#[derive(Debug, Clone)]
struct HeldButton {
    sources: BTreeSet<SourceId>,
    pressed_at: Instant,
    status: Status,
}

/// A fired chord whose buttons are still held
#[derive(Debug, Clone)]
struct Latch {
    buttons: BTreeSet<LogicalButton>,
    release: Option<Action>,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    chord: usize,
    fire_at: Instant,
}

#[derive(Debug, Clone)]
struct PendingSequence {
    /// Ordered chords that matched so far and have steps left
    candidates: Vec<usize>,
    matched: usize,
    last_step_at: Instant,
    buffer: Vec<LogicalEvent>,
    /// Longest completed chord and the buffer length when it completed
    completed: Option<(usize, usize)>,
}

pub struct Recognizer {
    chords: Vec<ChordDefinition>,
    gaps: Vec<Duration>,
    passthrough: HashSet<LogicalButton>,
    sequence_starts: HashSet<LogicalButton>,
    held: BTreeMap<LogicalButton, HeldButton>,
    latches: Vec<Latch>,
    armed: Vec<Armed>,
    sequence: Option<PendingSequence>,
    clock: Option<Instant>,
}

fn release_for(action: &Action) -> Option<Action> {
    match action {
        Action::SynthesizeButton(button, Phase::Down) => {
            Some(Action::SynthesizeButton(*button, Phase::Up))
        }
        _ => None,
    }
}

impl Recognizer {
    pub fn new(profile: &QuirkProfile) -> Self {
        Self {
            chords: profile.chords.clone(),
            gaps: profile.chords.iter().map(|c| profile.chord_gap(c)).collect(),
            passthrough: profile.passthrough_buttons(),
            sequence_starts: profile
                .chords
                .iter()
                .filter(|c| c.kind == ChordKind::Ordered)
                .map(|c| c.buttons[0])
                .collect(),
            held: BTreeMap::new(),
            latches: Vec::new(),
            armed: Vec::new(),
            sequence: None,
            clock: None,
        }
    }

    pub fn phase(&self) -> RecognizerPhase {
        if self.sequence.is_some() {
            RecognizerPhase::SequencePending
        } else if !self.held.is_empty() {
            RecognizerPhase::Holding
        } else {
            RecognizerPhase::Idle
        }
    }

    /// Process one logical event, first firing anything due at its timestamp
    pub fn handle(&mut self, mut event: LogicalEvent) -> Vec<Action> {
        // Readers stamp events independently, so queue order may run behind the clock
        event.timestamp = self.monotonic(event.timestamp);
        let mut out = self.advance(event.timestamp);
        self.process(event, &mut out);
        out
    }

    /// Fire deadlines that are due at `now`
    pub fn advance(&mut self, now: Instant) -> Vec<Action> {
        let now = self.monotonic(now);
        let mut out = Vec::new();

        let expired = match self.sequence.as_mut() {
            Some(seq) => {
                let last = seq.last_step_at;
                let gaps = &self.gaps;
                seq.candidates.retain(|&c| now < last + gaps[c]);
                seq.candidates.is_empty()
            }
            None => false,
        };
        if expired {
            self.finish_sequence(now, &mut out);
        }

        self.evaluate(now, &mut out);
        out
    }

    /// Earliest instant at which [`Recognizer::advance`] may produce output
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines: Vec<Instant> = self.armed.iter().map(|a| a.fire_at).collect();

        if let Some(seq) = &self.sequence {
            deadlines.extend(seq.candidates.iter().map(|&c| seq.last_step_at + self.gaps[c]));
        }
        for i in self.concurrent_chords().filter(|&i| !self.is_satisfied(i)) {
            if let Some(start) = self.window_start(i) {
                deadlines.push(start + self.gaps[i]);
            }
        }

        deadlines
            .into_iter()
            .filter(|d| self.clock.map_or(true, |clock| *d > clock))
            .min()
    }

    /// Drop everything a source contributed, e.g. after it was unplugged
    pub fn reset_source(&mut self, source: &SourceId, now: Instant) -> Vec<Action> {
        let now = self.monotonic(now);
        let mut out = Vec::new();

        let touches_sequence = self
            .sequence
            .as_ref()
            .map_or(false, |seq| seq.buffer.iter().any(|e| &e.source == source));
        if touches_sequence {
            if let Some(seq) = self.sequence.take() {
                debug!("Discarding pending sequence after reset of {}", source);
                for event in seq.buffer.into_iter().filter(|e| &e.source != source) {
                    self.concurrent(event, &mut out);
                }
            }
        }

        let buttons: Vec<LogicalButton> = self
            .held
            .iter()
            .filter(|(_, held)| held.sources.contains(source))
            .map(|(button, _)| *button)
            .collect();
        for button in buttons {
            self.lift(source, button, false, &mut out);
        }

        self.evaluate(now, &mut out);
        out
    }

    /// Forget all state, releasing whatever was reported or latched
    pub fn reset_all(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.sequence = None;
        self.armed.clear();

        for (button, held) in std::mem::take(&mut self.held) {
            if held.status == Status::Reported {
                out.push(Action::SynthesizeButton(button, Phase::Up));
            }
        }
        out.extend(std::mem::take(&mut self.latches).into_iter().filter_map(|l| l.release));
        out
    }

    fn monotonic(&self, at: Instant) -> Instant {
        self.clock.map_or(at, |clock| clock.max(at))
    }

    fn process(&mut self, event: LogicalEvent, out: &mut Vec<Action>) {
        if self.sequence.is_some() {
            self.sequence_event(event, out);
        } else if event.phase == Phase::Down
            && !self.held.contains_key(&event.button)
            && self.sequence_starts.contains(&event.button)
        {
            let candidates = self
                .chords
                .iter()
                .enumerate()
                .filter(|(_, c)| c.kind == ChordKind::Ordered && c.buttons[0] == event.button)
                .map(|(i, _)| i)
                .collect();
            debug!("Sequence started by {}", event.button);
            self.sequence = Some(PendingSequence {
                candidates,
                matched: 1,
                last_step_at: event.timestamp,
                buffer: vec![event],
                completed: None,
            });
        } else {
            self.concurrent(event, out);
        }
    }

    fn sequence_event(&mut self, event: LogicalEvent, out: &mut Vec<Action>) {
        let Some(seq) = self.sequence.as_mut() else {
            return;
        };
        let buffered = seq.buffer.iter().any(|e| e.button == event.button);

        match event.phase {
            Phase::Up if buffered => seq.buffer.push(event),
            Phase::Up => self.concurrent(event, out),
            Phase::Down if self.held.contains_key(&event.button) => self.concurrent(event, out),
            Phase::Down if buffered => seq.buffer.push(event),
            Phase::Down => {
                let at = event.timestamp;
                let next: Vec<usize> = seq
                    .candidates
                    .iter()
                    .copied()
                    .filter(|&c| {
                        self.chords[c].buttons[seq.matched] == event.button
                            && at < seq.last_step_at + self.gaps[c]
                    })
                    .collect();

                if next.is_empty() {
                    self.finish_sequence(at, out);
                    self.process(event, out);
                    return;
                }

                seq.matched += 1;
                seq.last_step_at = at;
                seq.buffer.push(event);
                let matched = seq.matched;
                if let Some(&done) = next.iter().find(|&&c| self.chords[c].buttons.len() == matched) {
                    seq.completed = Some((done, seq.buffer.len()));
                }
                seq.candidates = next
                    .into_iter()
                    .filter(|&c| self.chords[c].buttons.len() > matched)
                    .collect();

                if seq.candidates.is_empty() {
                    self.finish_sequence(at, out);
                }
            }
        }
    }

    /// Fire the best completed sequence, if any, and replay the rest
    fn finish_sequence(&mut self, now: Instant, out: &mut Vec<Action>) {
        let Some(seq) = self.sequence.take() else {
            return;
        };
        let mut rest = seq.buffer;

        if let Some((chord, len)) = seq.completed {
            let consumed: Vec<LogicalEvent> = rest.drain(..len).collect();
            let definition = &self.chords[chord];
            let action = definition.action.clone();
            debug!("Sequence {} fired: {}", definition.label(chord), action);

            self.latches.push(Latch {
                buttons: definition.button_set(),
                release: release_for(&action),
            });
            out.push(action);

            for event in consumed {
                match event.phase {
                    Phase::Down => {
                        let held = self.held.entry(event.button).or_insert_with(|| HeldButton {
                            sources: BTreeSet::new(),
                            pressed_at: event.timestamp,
                            status: Status::Consumed,
                        });
                        held.sources.insert(event.source);
                    }
                    Phase::Up => self.lift(&event.source, event.button, false, out),
                }
            }
        } else {
            debug!("Sequence abandoned, replaying {} events", rest.len());
        }

        for event in rest {
            self.concurrent(event, out);
        }
        self.evaluate(now, out);
    }

    fn concurrent(&mut self, event: LogicalEvent, out: &mut Vec<Action>) {
        match event.phase {
            Phase::Down => self.press(event.source, event.button, event.timestamp, out),
            Phase::Up => self.lift(&event.source, event.button, true, out),
        }
        self.evaluate(event.timestamp, out);
    }

    fn press(&mut self, source: SourceId, button: LogicalButton, at: Instant, out: &mut Vec<Action>) {
        if let Some(held) = self.held.get_mut(&button) {
            held.sources.insert(source);
            return;
        }

        let is_member = self
            .concurrent_chords()
            .any(|i| self.chords[i].buttons.contains(&button));
        let status = if is_member {
            Status::Pending
        } else if self.passthrough.contains(&button) {
            out.push(Action::SynthesizeButton(button, Phase::Down));
            Status::Reported
        } else {
            Status::Silent
        };

        self.held.insert(
            button,
            HeldButton {
                sources: BTreeSet::from([source]),
                pressed_at: at,
                status,
            },
        );
    }

    /// Release `button` from `source`; a no-op if that source does not hold it
    fn lift(&mut self, source: &SourceId, button: LogicalButton, replay_taps: bool, out: &mut Vec<Action>) {
        let Some(held) = self.held.get_mut(&button) else {
            return;
        };
        if !held.sources.remove(source) || !held.sources.is_empty() {
            return;
        }

        let status = held.status;
        self.held.remove(&button);

        match status {
            Status::Pending => {
                self.armed.retain(|a| !self.chords[a.chord].buttons.contains(&button));
                if replay_taps && self.passthrough.contains(&button) {
                    out.push(Action::SynthesizeButton(button, Phase::Down));
                    out.push(Action::SynthesizeButton(button, Phase::Up));
                }
            }
            Status::Reported => out.push(Action::SynthesizeButton(button, Phase::Up)),
            Status::Consumed => {
                for latch in &mut self.latches {
                    latch.buttons.remove(&button);
                }
                let (done, open): (Vec<Latch>, Vec<Latch>) = std::mem::take(&mut self.latches)
                    .into_iter()
                    .partition(|l| l.buttons.is_empty());
                self.latches = open;
                out.extend(done.into_iter().filter_map(|l| l.release));
            }
            Status::Silent => {}
        }
    }

    /// Fire satisfied chords that are due, arm the others and flush buttons
    /// no chord can claim anymore
    fn evaluate(&mut self, now: Instant, out: &mut Vec<Action>) {
        self.clock = Some(self.clock.map_or(now, |clock| clock.max(now)));

        loop {
            let mut satisfied: Vec<usize> = self
                .concurrent_chords()
                .filter(|&i| self.is_satisfied(i))
                .collect();
            satisfied.sort_by_key(|&i| (Reverse(self.chords[i].buttons.len()), i));

            self.armed.clear();
            let mut claimed: HashSet<LogicalButton> = HashSet::new();
            let mut fired = false;

            for chord in satisfied {
                let buttons = &self.chords[chord].buttons;
                if buttons.iter().any(|b| claimed.contains(b)) {
                    continue;
                }
                claimed.extend(buttons.iter().copied());

                let fire_at = self.fire_time(chord, now);
                if fire_at <= now {
                    self.fire(chord, out);
                    fired = true;
                    break;
                }
                self.armed.push(Armed { chord, fire_at });
            }

            if !fired {
                break;
            }
        }

        self.flush(now, out);
    }

    fn fire(&mut self, chord: usize, out: &mut Vec<Action>) {
        let definition = &self.chords[chord];
        for button in &definition.buttons {
            if let Some(held) = self.held.get_mut(button) {
                held.status = Status::Consumed;
            }
        }
        debug!("Chord {} fired: {}", definition.label(chord), definition.action);
        self.latches.push(Latch {
            buttons: definition.button_set(),
            release: release_for(&definition.action),
        });
        out.push(definition.action.clone());
    }

    /// When a satisfied chord may fire: after its minimum hold and after every
    /// larger chord containing it had its chance to complete
    fn fire_time(&self, chord: usize, now: Instant) -> Instant {
        let definition = &self.chords[chord];
        let last = definition
            .buttons
            .iter()
            .filter_map(|b| self.held.get(b).map(|h| h.pressed_at))
            .max()
            .unwrap_or(now);
        let mut fire_at = last + definition.min_hold().unwrap_or(Duration::ZERO);

        let members = definition.button_set();
        for larger in self.concurrent_chords() {
            let candidate = &self.chords[larger];
            if candidate.buttons.len() <= members.len()
                || !members.iter().all(|b| candidate.buttons.contains(b))
            {
                continue;
            }
            if let Some(start) = self.window_start(larger) {
                let deadline = start + self.gaps[larger];
                if now < deadline {
                    fire_at = fire_at.max(deadline);
                }
            }
        }
        fire_at
    }

    fn flush(&mut self, now: Instant, out: &mut Vec<Action>) {
        let dead: Vec<LogicalButton> = self
            .held
            .iter()
            .filter(|(_, held)| held.status == Status::Pending)
            .map(|(button, _)| *button)
            .filter(|button| {
                !self.concurrent_chords().any(|i| {
                    self.chords[i].buttons.contains(button)
                        && (self.is_satisfied(i) || self.is_possible(i, now))
                })
            })
            .collect();

        for button in dead {
            let passthrough = self.passthrough.contains(&button);
            if let Some(held) = self.held.get_mut(&button) {
                if passthrough {
                    held.status = Status::Reported;
                    out.push(Action::SynthesizeButton(button, Phase::Down));
                } else {
                    held.status = Status::Silent;
                }
            }
        }
    }

    fn concurrent_chords(&self) -> impl Iterator<Item = usize> + '_ {
        self.chords
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_concurrent())
            .map(|(i, _)| i)
    }

    /// Press time of the earliest held member, if every held member is still pending
    fn window_start(&self, chord: usize) -> Option<Instant> {
        let mut start: Option<Instant> = None;
        for button in &self.chords[chord].buttons {
            if let Some(held) = self.held.get(button) {
                if held.status != Status::Pending {
                    return None;
                }
                start = Some(start.map_or(held.pressed_at, |s| s.min(held.pressed_at)));
            }
        }
        start
    }

    fn is_possible(&self, chord: usize, now: Instant) -> bool {
        self.window_start(chord)
            .map_or(false, |start| now < start + self.gaps[chord])
    }

    fn is_satisfied(&self, chord: usize) -> bool {
        let mut first: Option<Instant> = None;
        let mut last: Option<Instant> = None;
        for button in &self.chords[chord].buttons {
            match self.held.get(button) {
                Some(held) if held.status == Status::Pending => {
                    first = Some(first.map_or(held.pressed_at, |f| f.min(held.pressed_at)));
                    last = Some(last.map_or(held.pressed_at, |l| l.max(held.pressed_at)));
                }
                _ => return false,
            }
        }
        match (first, last) {
            (Some(first), Some(last)) => last - first < self.gaps[chord],
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handycon_common::{ModeId, PowerKind};

    const PROFILE: &str = r#"
name: TEST
product_names: ["Test Handheld"]
modes: [default, quickmenu]
chord_gap_ms: 60
sources:
  - { id: keyboard, role: keyboard, name: "AT Translated Set 2 keyboard" }
  - { id: gamepad, role: gamepad, name: "Microsoft X-Box 360 pad" }
mappings:
  - { source: keyboard, code: 30, button: "key:30", passthrough: true }
  - { source: keyboard, code: 31, button: "key:31", passthrough: true }
  - { source: keyboard, code: 32, button: "key:32" }
  - { source: keyboard, code: 44, button: "key:44", passthrough: true }
  - { source: keyboard, code: 45, button: "key:45", passthrough: true }
  - { source: keyboard, code: 46, button: "key:46" }
  - { source: keyboard, code: 99, button: "key:99" }
  - { source: keyboard, code: 115, button: volume_up, passthrough: true }
  - { source: keyboard, code: 186, button: turbo }
chords:
  - name: ab
    buttons: ["key:30", "key:31"]
    action: !synthesize_button [quick_access, down]
  - name: abc
    buttons: ["key:30", "key:31", "key:32"]
    action: !synthesize_button [keyboard, down]
  - name: hold
    buttons: [mode]
    min_hold_ms: 1000
    action: !toggle_mode quickmenu
  - name: screenshot
    buttons: ["key:99"]
    action: !synthesize_button [screenshot, down]
  - name: xy
    kind: ordered
    buttons: ["key:44", "key:45"]
    max_gap_ms: 200
    action: !synthesize_button [escape, down]
  - name: xyz
    kind: ordered
    buttons: ["key:44", "key:45", "key:46"]
    max_gap_ms: 200
    action: !power_request suspend
"#;

    const A: LogicalButton = LogicalButton::Key(30);
    const B: LogicalButton = LogicalButton::Key(31);
    const C: LogicalButton = LogicalButton::Key(32);
    const X: LogicalButton = LogicalButton::Key(44);
    const Y: LogicalButton = LogicalButton::Key(45);
    const Z: LogicalButton = LogicalButton::Key(46);
    const SHOT: LogicalButton = LogicalButton::Key(99);

    struct Harness {
        recognizer: Recognizer,
        start: Instant,
        keyboard: SourceId,
    }

    impl Harness {
        fn new() -> Self {
            let profile = QuirkProfile::from_yaml(PROFILE).unwrap();
            profile.validate().unwrap();
            Self {
                recognizer: Recognizer::new(&profile),
                start: Instant::now(),
                keyboard: SourceId::new("keyboard"),
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.start + Duration::from_millis(ms)
        }

        fn event(&mut self, source: &SourceId, button: LogicalButton, phase: Phase, ms: u64) -> Vec<Action> {
            let event = LogicalEvent::new(source, button, phase, self.at(ms));
            self.recognizer.handle(event)
        }

        fn down(&mut self, button: LogicalButton, ms: u64) -> Vec<Action> {
            let source = self.keyboard.clone();
            self.event(&source, button, Phase::Down, ms)
        }

        fn up(&mut self, button: LogicalButton, ms: u64) -> Vec<Action> {
            let source = self.keyboard.clone();
            self.event(&source, button, Phase::Up, ms)
        }

        fn advance(&mut self, ms: u64) -> Vec<Action> {
            let now = self.at(ms);
            self.recognizer.advance(now)
        }
    }

    fn press(button: LogicalButton) -> Action {
        Action::SynthesizeButton(button, Phase::Down)
    }

    fn release(button: LogicalButton) -> Action {
        Action::SynthesizeButton(button, Phase::Up)
    }

    #[test]
    fn test_single_button_chord_fires_and_releases() {
        let mut h = Harness::new();
        assert_eq!(h.down(SHOT, 0), vec![press(LogicalButton::Screenshot)]);
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Holding);
        assert_eq!(h.up(SHOT, 80), vec![release(LogicalButton::Screenshot)]);
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
    }

    #[test]
    fn test_longest_chord_wins() {
        let mut h = Harness::new();
        assert!(h.down(A, 0).is_empty());
        assert!(h.down(B, 10).is_empty());
        assert_eq!(h.down(C, 20), vec![press(LogicalButton::Keyboard)]);

        assert!(h.up(A, 100).is_empty());
        assert!(h.up(C, 110).is_empty());
        assert_eq!(h.up(B, 120), vec![release(LogicalButton::Keyboard)]);
        assert!(h.advance(1000).is_empty());
    }

    #[test]
    fn test_shorter_chord_fires_once_larger_cannot_complete() {
        let mut h = Harness::new();
        h.down(A, 0);
        h.down(B, 10);
        assert_eq!(h.recognizer.next_deadline(), Some(h.at(60)));
        assert!(h.advance(59).is_empty());
        assert_eq!(h.advance(60), vec![press(LogicalButton::QuickAccess)]);

        // A late third button cannot upgrade the fired chord
        assert!(h.down(C, 70).is_empty());
        assert!(h.advance(200).is_empty());
        h.up(A, 300);
        assert_eq!(h.up(B, 310), vec![release(LogicalButton::QuickAccess)]);
        assert!(h.up(C, 320).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
    }

    #[test]
    fn test_due_deadline_fires_before_new_press() {
        let mut h = Harness::new();
        h.down(A, 0);
        h.down(B, 10);
        assert_eq!(h.down(C, 60), vec![press(LogicalButton::QuickAccess)]);
    }

    #[test]
    fn test_presses_outside_gap_do_not_chord() {
        let mut h = Harness::new();
        h.down(A, 0);
        assert_eq!(h.advance(60), vec![press(A)]);
        // Every chord containing B already lost A, so B is reported at once
        assert_eq!(h.down(B, 100), vec![press(B)]);
        assert!(h.advance(160).is_empty());
        assert_eq!(h.up(A, 200), vec![release(A)]);
        assert_eq!(h.up(B, 210), vec![release(B)]);
    }

    #[test]
    fn test_late_stamped_press_still_gets_a_deadline() {
        let mut h = Harness::new();
        h.down(LogicalButton::VolumeUp, 500);
        // Stamped before the clock, so its window is measured from 500
        assert!(h.down(A, 100).is_empty());
        assert_eq!(h.recognizer.next_deadline(), Some(h.at(560)));
        assert_eq!(h.advance(560), vec![press(A)]);
    }

    #[test]
    fn test_pending_passthrough_is_replayed_as_tap() {
        let mut h = Harness::new();
        assert!(h.down(A, 0).is_empty());
        assert_eq!(h.up(A, 20), vec![press(A), release(A)]);
        assert!(h.advance(500).is_empty());
    }

    #[test]
    fn test_pending_non_passthrough_is_swallowed() {
        let mut h = Harness::new();
        assert!(h.down(C, 0).is_empty());
        assert!(h.advance(60).is_empty());
        assert!(h.up(C, 90).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
    }

    #[test]
    fn test_non_member_buttons() {
        let mut h = Harness::new();
        assert_eq!(h.down(LogicalButton::VolumeUp, 0), vec![press(LogicalButton::VolumeUp)]);
        assert_eq!(h.up(LogicalButton::VolumeUp, 10), vec![release(LogicalButton::VolumeUp)]);
        assert!(h.down(LogicalButton::Turbo, 20).is_empty());
        assert!(h.up(LogicalButton::Turbo, 30).is_empty());
    }

    #[test]
    fn test_hold_chord_fires_once_after_hold() {
        let mut h = Harness::new();
        assert!(h.down(LogicalButton::Mode, 0).is_empty());
        assert_eq!(h.recognizer.next_deadline(), Some(h.at(1000)));
        assert!(h.advance(999).is_empty());

        let fired = h.advance(1000);
        assert_eq!(fired, vec![Action::ToggleMode(ModeId::new("quickmenu"))]);
        assert!(h.advance(1200).is_empty());
        assert_eq!(h.recognizer.next_deadline(), None);
        assert!(h.up(LogicalButton::Mode, 1200).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
    }

    #[test]
    fn test_hold_chord_released_early_never_fires() {
        let mut h = Harness::new();
        h.down(LogicalButton::Mode, 0);
        assert!(h.up(LogicalButton::Mode, 500).is_empty());
        assert_eq!(h.recognizer.next_deadline(), None);
        assert!(h.advance(2000).is_empty());
    }

    #[test]
    fn test_mirrored_sources_count_once() {
        let mut h = Harness::new();
        let gamepad = SourceId::new("gamepad");
        assert_eq!(h.down(SHOT, 0), vec![press(LogicalButton::Screenshot)]);
        assert!(h.event(&gamepad, SHOT, Phase::Down, 5).is_empty());
        assert!(h.up(SHOT, 50).is_empty());
        assert_eq!(
            h.event(&gamepad, SHOT, Phase::Up, 60),
            vec![release(LogicalButton::Screenshot)]
        );
    }

    #[test]
    fn test_release_without_press_is_ignored() {
        let mut h = Harness::new();
        assert!(h.up(A, 0).is_empty());
        assert!(h.up(LogicalButton::VolumeUp, 0).is_empty());
        h.down(SHOT, 10);
        let gamepad = SourceId::new("gamepad");
        assert!(h.event(&gamepad, SHOT, Phase::Up, 20).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Holding);
    }

    #[test]
    fn test_sequence_waits_for_longer_candidate() {
        let mut h = Harness::new();
        assert!(h.down(X, 0).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::SequencePending);
        assert!(h.down(Y, 100).is_empty());
        assert!(h.up(X, 150).is_empty());
        assert_eq!(h.recognizer.next_deadline(), Some(h.at(300)));

        assert_eq!(h.advance(300), vec![press(LogicalButton::Escape)]);
        assert_eq!(h.up(Y, 350), vec![release(LogicalButton::Escape)]);
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
    }

    #[test]
    fn test_longest_sequence_fires_immediately() {
        let mut h = Harness::new();
        h.down(X, 0);
        h.down(Y, 100);
        assert_eq!(h.down(Z, 250), vec![Action::PowerRequest(PowerKind::Suspend)]);
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Holding);
        assert!(h.up(X, 300).is_empty());
        assert!(h.up(Y, 300).is_empty());
        assert!(h.up(Z, 300).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
    }

    #[test]
    fn test_late_step_replays_both_presses() {
        let mut h = Harness::new();
        h.down(X, 0);
        // The deadline is inclusive: a step exactly at it is too late
        assert_eq!(h.down(Y, 200), vec![press(X), press(Y)]);
        assert_eq!(h.up(X, 250), vec![release(X)]);
        assert_eq!(h.up(Y, 260), vec![release(Y)]);
    }

    #[test]
    fn test_non_step_press_aborts_sequence() {
        let mut h = Harness::new();
        h.down(X, 0);
        h.up(X, 20);
        assert_eq!(
            h.down(LogicalButton::VolumeUp, 30),
            vec![press(X), release(X), press(LogicalButton::VolumeUp)]
        );
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Holding);
    }

    #[test]
    fn test_reset_source_is_idempotent() {
        let mut h = Harness::new();
        let gamepad = SourceId::new("gamepad");
        let keyboard = h.keyboard.clone();
        h.down(LogicalButton::VolumeUp, 0);
        h.down(SHOT, 10);
        h.event(&gamepad, A, Phase::Down, 20);

        let first = h.recognizer.reset_source(&keyboard, h.at(30));
        assert_eq!(first.len(), 2);
        assert!(first.contains(&release(LogicalButton::VolumeUp)));
        assert!(first.contains(&release(LogicalButton::Screenshot)));

        assert!(h.recognizer.reset_source(&keyboard, h.at(30)).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Holding);

        assert!(h.recognizer.reset_source(&gamepad, h.at(40)).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
        assert!(h.advance(1000).is_empty());
    }

    #[test]
    fn test_reset_clears_pending_chord() {
        let mut h = Harness::new();
        let keyboard = h.keyboard.clone();
        h.down(LogicalButton::Mode, 0);
        assert!(h.recognizer.reset_source(&keyboard, h.at(300)).is_empty());
        assert!(h.advance(1500).is_empty());

        h.down(LogicalButton::Mode, 2000);
        assert_eq!(h.advance(3000), vec![Action::ToggleMode(ModeId::new("quickmenu"))]);
    }

    #[test]
    fn test_reset_discards_sequence_of_source() {
        let mut h = Harness::new();
        let keyboard = h.keyboard.clone();
        h.down(X, 0);
        assert!(h.recognizer.reset_source(&keyboard, h.at(50)).is_empty());
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
        assert!(h.advance(500).is_empty());
    }

    #[test]
    fn test_reset_all() {
        let mut h = Harness::new();
        h.down(LogicalButton::VolumeUp, 0);
        h.down(A, 10);
        h.down(B, 20);
        h.down(C, 30);
        h.down(X, 40);

        let released = h.recognizer.reset_all();
        assert_eq!(
            released,
            vec![release(LogicalButton::VolumeUp), release(LogicalButton::Keyboard)]
        );
        assert_eq!(h.recognizer.phase(), RecognizerPhase::Idle);
        assert_eq!(h.recognizer.next_deadline(), None);
    }
}
