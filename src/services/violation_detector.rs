use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::session::{MediaKind, SessionStatus};
use crate::models::violation::{Violation, ViolationType};

/// Raw signal observed by the exam client (the browser event it maps to is
/// noted per variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrowserSignal {
    /// `visibilitychange` with `document.hidden == true`
    VisibilityHidden,
    VisibilityVisible,
    /// `window.blur`
    WindowBlur,
    WindowFocus,
    /// `contextmenu`
    ContextMenu,
    /// `keydown`
    KeyDown(KeyCombo),
    /// `fullscreenchange`
    FullscreenChange { fullscreen: bool },
    /// `ended` on a display-capture track
    ScreenShareEnded,
    /// `ended` on a webcam track
    WebcamEnded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCombo {
    pub key: String,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub meta: bool,
}

impl KeyCombo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            shift: false,
            alt: false,
            meta: false,
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    /// Ctrl+C/V/X, F12 and Ctrl+Shift+I. Cmd counts as Ctrl.
    pub fn is_restricted(&self) -> bool {
        let key = self.key.to_ascii_lowercase();
        if key == "f12" {
            return true;
        }
        let command = self.ctrl || self.meta;
        if !command {
            return false;
        }
        match key.as_str() {
            "c" | "v" | "x" => true,
            "i" => self.shift,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorContext {
    pub status: SessionStatus,
    pub is_proctored: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub violation: Option<Violation>,
    pub suppress_default: bool,
    pub capture_lost: Option<MediaKind>,
    pub fullscreen: Option<bool>,
}

/// Turns browser signals into typed violations. Holds only debounce state.
///
/// Browsers fire `blur` before `visibilitychange` when the student switches
/// tabs. A blur is therefore held for at least one debounce window. If the
/// tab is hidden while the blur is held, the departure is a single
/// TAB_SWITCH; focus returning or [`ViolationDetector::flush`] after the
/// window releases it as WINDOW_BLUR.
#[derive(Debug)]
pub struct ViolationDetector {
    debounce: Duration,
    hidden: bool,
    held_blur: Option<DateTime<Utc>>,
    last_emitted: HashMap<ViolationType, DateTime<Utc>>,
}

impl ViolationDetector {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            hidden: false,
            held_blur: None,
            last_emitted: HashMap::new(),
        }
    }

    pub fn observe(
        &mut self,
        signal: &BrowserSignal,
        ctx: DetectorContext,
        now: DateTime<Utc>,
    ) -> Detection {
        let was_hidden = self.hidden;
        match signal {
            BrowserSignal::VisibilityHidden => self.hidden = true,
            BrowserSignal::VisibilityVisible => self.hidden = false,
            _ => {}
        }

        if ctx.status != SessionStatus::InProgress {
            self.held_blur = None;
            return Detection::default();
        }

        let mut detection = Detection::default();
        match signal {
            BrowserSignal::VisibilityHidden => {
                if self.held_blur.take().is_some() {
                    tracing::debug!("blur folded into tab switch");
                }
                if !was_hidden {
                    detection.violation = self.emit(ViolationType::TabSwitch, now);
                }
            }
            BrowserSignal::WindowBlur => {
                if !self.hidden && self.held_blur.is_none() {
                    if self.debounce > Duration::zero() {
                        self.held_blur = Some(now);
                    } else {
                        detection.violation = self.emit(ViolationType::WindowBlur, now);
                    }
                }
            }
            BrowserSignal::WindowFocus => {
                if let Some(blurred_at) = self.held_blur.take() {
                    detection.violation = self.emit(ViolationType::WindowBlur, blurred_at);
                }
            }
            BrowserSignal::ContextMenu => {
                detection.suppress_default = true;
                detection.violation = self.emit(ViolationType::RightClick, now);
            }
            BrowserSignal::KeyDown(combo) if combo.is_restricted() => {
                detection.suppress_default = true;
                detection.violation = self.emit(ViolationType::CopyPaste, now);
            }
            BrowserSignal::FullscreenChange { fullscreen } => {
                detection.fullscreen = Some(*fullscreen);
                if !fullscreen && ctx.is_proctored {
                    detection.violation = self.emit(ViolationType::FullscreenExit, now);
                }
            }
            BrowserSignal::ScreenShareEnded => detection.capture_lost = Some(MediaKind::Screen),
            BrowserSignal::WebcamEnded => detection.capture_lost = Some(MediaKind::Webcam),
            BrowserSignal::KeyDown(_) | BrowserSignal::VisibilityVisible => {}
        }
        detection
    }

    /// Emits a held blur once its window has passed without the tab being
    /// hidden. Called on every clock tick.
    pub fn flush(&mut self, ctx: DetectorContext, now: DateTime<Utc>) -> Option<Violation> {
        if ctx.status != SessionStatus::InProgress {
            self.held_blur = None;
            return None;
        }
        let blurred_at = self.held_blur?;
        if now - blurred_at < self.debounce {
            return None;
        }
        self.held_blur = None;
        self.emit(ViolationType::WindowBlur, blurred_at)
    }

    fn emit(&mut self, kind: ViolationType, now: DateTime<Utc>) -> Option<Violation> {
        if let Some(last) = self.last_emitted.get(&kind) {
            if now - *last < self.debounce {
                tracing::debug!(?kind, "debounced duplicate violation");
                return None;
            }
        }
        self.last_emitted.insert(kind, now);
        Some(Violation::new(kind, now))
    }
}

/// Injectable source of browser signals.
#[async_trait]
pub trait EventSource: Send {
    async fn next_signal(&mut self) -> Option<BrowserSignal>;
}

pub struct ChannelEventSource {
    rx: mpsc::Receiver<BrowserSignal>,
}

impl ChannelEventSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<BrowserSignal>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_signal(&mut self) -> Option<BrowserSignal> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(proctored: bool) -> DetectorContext {
        DetectorContext {
            status: SessionStatus::InProgress,
            is_proctored: proctored,
        }
    }

    fn detector() -> ViolationDetector {
        ViolationDetector::new(Duration::milliseconds(500))
    }

    #[test]
    fn hidden_tab_emits_one_tab_switch_until_visible_again() {
        let mut det = detector();
        let t0 = Utc::now();

        let first = det.observe(&BrowserSignal::VisibilityHidden, active(true), t0);
        assert_eq!(
            first.violation.map(|v| v.violation_type),
            Some(ViolationType::TabSwitch)
        );

        let repeat = det.observe(
            &BrowserSignal::VisibilityHidden,
            active(true),
            t0 + Duration::seconds(2),
        );
        assert!(repeat.violation.is_none());

        det.observe(&BrowserSignal::VisibilityVisible, active(true), t0 + Duration::seconds(3));
        let again = det.observe(
            &BrowserSignal::VisibilityHidden,
            active(true),
            t0 + Duration::seconds(4),
        );
        assert!(again.violation.is_some());
    }

    #[test]
    fn blur_while_hidden_is_not_a_second_violation() {
        let mut det = detector();
        let t0 = Utc::now();
        det.observe(&BrowserSignal::VisibilityHidden, active(false), t0);
        let blur = det.observe(&BrowserSignal::WindowBlur, active(false), t0 + Duration::seconds(1));
        assert!(blur.violation.is_none());
    }

    #[test]
    fn blur_then_hidden_is_one_tab_switch() {
        let mut det = detector();
        let t0 = Utc::now();

        let blur = det.observe(&BrowserSignal::WindowBlur, active(true), t0);
        assert!(blur.violation.is_none());
        let hidden = det.observe(
            &BrowserSignal::VisibilityHidden,
            active(true),
            t0 + Duration::milliseconds(30),
        );
        assert_eq!(
            hidden.violation.map(|v| v.violation_type),
            Some(ViolationType::TabSwitch)
        );
        assert!(det.flush(active(true), t0 + Duration::seconds(2)).is_none());
        let back = det.observe(&BrowserSignal::WindowFocus, active(true), t0 + Duration::seconds(3));
        assert!(back.violation.is_none());
    }

    #[test]
    fn held_blur_is_released_by_focus_or_flush() {
        let mut det = detector();
        let t0 = Utc::now();

        det.observe(&BrowserSignal::WindowBlur, active(false), t0);
        let focus = det.observe(&BrowserSignal::WindowFocus, active(false), t0 + Duration::milliseconds(200));
        let released = focus.violation.unwrap();
        assert_eq!(released.violation_type, ViolationType::WindowBlur);
        assert_eq!(released.timestamp, t0);

        let t1 = t0 + Duration::seconds(5);
        det.observe(&BrowserSignal::WindowBlur, active(false), t1);
        assert!(det.flush(active(false), t1 + Duration::milliseconds(100)).is_none());
        let flushed = det.flush(active(false), t1 + Duration::seconds(1)).unwrap();
        assert_eq!(flushed.violation_type, ViolationType::WindowBlur);
        assert!(det.flush(active(false), t1 + Duration::seconds(2)).is_none());
    }

    #[test]
    fn blur_is_immediate_without_a_debounce_window() {
        let mut det = ViolationDetector::new(Duration::zero());
        let blur = det.observe(&BrowserSignal::WindowBlur, active(false), Utc::now());
        assert_eq!(
            blur.violation.map(|v| v.violation_type),
            Some(ViolationType::WindowBlur)
        );
    }

    #[test]
    fn nothing_is_emitted_outside_in_progress() {
        let mut det = detector();
        let now = Utc::now();
        for status in [
            SessionStatus::NotStarted,
            SessionStatus::Submitted,
            SessionStatus::AutoSubmitted,
            SessionStatus::Blocked,
        ] {
            let ctx = DetectorContext {
                status,
                is_proctored: true,
            };
            for signal in [
                BrowserSignal::VisibilityHidden,
                BrowserSignal::WindowBlur,
                BrowserSignal::ContextMenu,
                BrowserSignal::KeyDown(KeyCombo::new("c").ctrl()),
                BrowserSignal::FullscreenChange { fullscreen: false },
            ] {
                let detection = det.observe(&signal, ctx, now);
                assert_eq!(detection, Detection::default(), "{:?} in {:?}", signal, status);
            }
        }
    }

    #[test]
    fn right_click_and_restricted_keys_suppress_default() {
        let mut det = detector();
        let t0 = Utc::now();

        let menu = det.observe(&BrowserSignal::ContextMenu, active(false), t0);
        assert!(menu.suppress_default);
        assert_eq!(
            menu.violation.map(|v| v.violation_type),
            Some(ViolationType::RightClick)
        );

        let paste = det.observe(
            &BrowserSignal::KeyDown(KeyCombo::new("V").ctrl()),
            active(false),
            t0,
        );
        assert!(paste.suppress_default);
        assert_eq!(
            paste.violation.map(|v| v.violation_type),
            Some(ViolationType::CopyPaste)
        );

        let typing = det.observe(&BrowserSignal::KeyDown(KeyCombo::new("v")), active(false), t0);
        assert!(!typing.suppress_default);
        assert!(typing.violation.is_none());
    }

    #[test]
    fn restricted_combos() {
        assert!(KeyCombo::new("F12").is_restricted());
        assert!(KeyCombo::new("i").ctrl().shift().is_restricted());
        assert!(!KeyCombo::new("i").ctrl().is_restricted());
        assert!(KeyCombo::new("x").ctrl().is_restricted());
        let mut cmd_c = KeyCombo::new("c");
        cmd_c.meta = true;
        assert!(cmd_c.is_restricted());
        assert!(!KeyCombo::new("a").ctrl().is_restricted());
    }

    #[test]
    fn same_type_within_debounce_window_is_dropped() {
        let mut det = detector();
        let t0 = Utc::now();
        let combo = BrowserSignal::KeyDown(KeyCombo::new("c").ctrl());

        assert!(det.observe(&combo, active(false), t0).violation.is_some());
        let held = det.observe(&combo, active(false), t0 + Duration::milliseconds(100));
        assert!(held.violation.is_none());
        assert!(held.suppress_default);
        let later = det.observe(&combo, active(false), t0 + Duration::milliseconds(800));
        assert!(later.violation.is_some());
    }

    #[test]
    fn fullscreen_exit_only_counts_for_proctored_sessions() {
        let mut det = detector();
        let now = Utc::now();
        let exit = BrowserSignal::FullscreenChange { fullscreen: false };

        let open = det.observe(&exit, active(false), now);
        assert!(open.violation.is_none());
        assert_eq!(open.fullscreen, Some(false));

        let proctored = det.observe(&exit, active(true), now);
        assert_eq!(
            proctored.violation.map(|v| v.violation_type),
            Some(ViolationType::FullscreenExit)
        );
    }

    #[test]
    fn ended_tracks_become_capture_loss() {
        let mut det = detector();
        let detection = det.observe(&BrowserSignal::ScreenShareEnded, active(true), Utc::now());
        assert_eq!(detection.capture_lost, Some(MediaKind::Screen));
        assert!(detection.violation.is_none());
    }

    #[tokio::test]
    async fn channel_event_source_yields_sent_signals() {
        let (tx, mut source) = ChannelEventSource::new(4);
        tx.send(BrowserSignal::ContextMenu).await.unwrap();
        drop(tx);
        assert_eq!(source.next_signal().await, Some(BrowserSignal::ContextMenu));
        assert_eq!(source.next_signal().await, None);
    }
}
