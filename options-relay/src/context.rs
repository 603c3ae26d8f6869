use crate::instrument::ViewedInstrument;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::watch;
use tracing::info;

/// Operator declared mode in which live polling must stop (eg/ offline or backtest mode).
pub trait ModeFlag: Send + Sync + 'static {
    fn is_paused(&self) -> bool;
}

/// Operator controlled [`ModeFlag`].
#[derive(Debug, Default)]
pub struct PauseSwitch {
    paused: AtomicBool,
}

impl PauseSwitch {
    pub fn new(paused: bool) -> Self {
        Self {
            paused: AtomicBool::new(paused),
        }
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("relay paused by operator");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("relay resumed by operator");
        }
    }
}

impl ModeFlag for PauseSwitch {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Latest entry timing snapshot published by an external timing producer.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSnapshot {
    pub timing: Value,
    pub timestamp: i64,
}

/// Process wide state shared by the scheduler and every connection handler.
///
/// The viewed instrument is only changed through [`SharedContext::set_instrument`], which
/// notifies sessions while holding the write lock. Broadcasts of fetched data run under the
/// read lock via [`SharedContext::with_current`], so no session can receive data fetched for
/// the old instrument after it was told about the new one.
///
/// Lock order: context before the session table.
pub struct SharedContext {
    viewed: RwLock<ViewedInstrument>,
    changes: watch::Sender<ViewedInstrument>,
    timing: RwLock<Option<TimingSnapshot>>,
    mode: Arc<dyn ModeFlag>,
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContext")
            .field("viewed", &*self.viewed.read())
            .field("paused", &self.mode.is_paused())
            .finish()
    }
}

impl SharedContext {
    pub fn new(initial: ViewedInstrument, mode: Arc<dyn ModeFlag>) -> Self {
        let (changes, _rx) = watch::channel(initial.clone());
        Self {
            viewed: RwLock::new(initial),
            changes,
            timing: RwLock::new(None),
            mode,
        }
    }

    pub fn viewed(&self) -> ViewedInstrument {
        self.viewed.read().clone()
    }

    /// Receiver notified after every instrument change.
    pub fn changes(&self) -> watch::Receiver<ViewedInstrument> {
        self.changes.subscribe()
    }

    /// Replace the viewed instrument, calling `fan_out` with the new value before any reader
    /// can observe it. Returns the previous instrument.
    pub fn set_instrument<F>(&self, next: ViewedInstrument, fan_out: F) -> ViewedInstrument
    where
        F: FnOnce(&ViewedInstrument),
    {
        let mut viewed = self.viewed.write();
        let previous = std::mem::replace(&mut *viewed, next);
        fan_out(&viewed);
        self.changes.send_replace(viewed.clone());
        previous
    }

    /// Run `f` only if the viewed instrument still equals `expected`, holding it stable for
    /// the duration of `f`.
    pub fn with_current<F, R>(&self, expected: &ViewedInstrument, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        let viewed = self.viewed.read();
        (*viewed == *expected).then(f)
    }

    pub fn is_paused(&self) -> bool {
        self.mode.is_paused()
    }

    pub fn set_timing(&self, snapshot: TimingSnapshot) {
        *self.timing.write() = Some(snapshot);
    }

    pub fn latest_timing(&self) -> Option<TimingSnapshot> {
        self.timing.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;

    fn viewed(symbol: &str) -> ViewedInstrument {
        ViewedInstrument {
            symbol: SmolStr::new(symbol),
            expiration: "20251219".parse().unwrap(),
        }
    }

    #[test]
    fn test_set_instrument_fans_out_before_release() {
        let context = SharedContext::new(viewed("SPY"), Arc::new(PauseSwitch::default()));
        let mut changes = context.changes();

        let mut seen = None;
        let previous = context.set_instrument(viewed("QQQ"), |next| {
            seen = Some(next.symbol.clone());
        });

        assert_eq!(previous, viewed("SPY"));
        assert_eq!(seen, Some(SmolStr::new("QQQ")));
        assert!(changes.has_changed().unwrap());
        assert_eq!(changes.borrow_and_update().symbol, "QQQ");
    }

    #[test]
    fn test_with_current_discards_stale() {
        let context = SharedContext::new(viewed("SPY"), Arc::new(PauseSwitch::default()));

        assert_eq!(context.with_current(&viewed("SPY"), || 1), Some(1));

        context.set_instrument(viewed("QQQ"), |_| {});
        assert_eq!(context.with_current(&viewed("SPY"), || 1), None);
    }

    #[test]
    fn test_pause_switch() {
        let switch = Arc::new(PauseSwitch::new(true));
        let context = SharedContext::new(viewed("SPY"), switch.clone());
        assert!(context.is_paused());

        switch.resume();
        assert!(!context.is_paused());

        switch.pause();
        assert!(context.is_paused());
    }
}
