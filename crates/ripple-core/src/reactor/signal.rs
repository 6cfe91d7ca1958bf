//! Signal delivery backing `Reactor::setup_signal`/`cancel_signal`.
//!
//! The OS-level handler (installed once per signum by `signal_hook`) does
//! nothing beyond marking the signal pending; fan-out to registered
//! callbacks happens on the reactor's own turn, in registration order. This
//! is the single model the spec prescribes, replacing the source's two
//! overlapping fallback/tornado-backed variants (see SPEC_FULL.md §9).

use std::collections::HashMap;

use mio::Token;
use signal_hook_mio::v1_0::Signals;

use crate::error::RippleError;

pub(crate) type SignalCallback = Box<dyn FnMut()>;

/// Opaque handle returned by [`super::Reactor::setup_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle {
    pub(crate) signum: i32,
    pub(crate) id: u64,
}

pub(crate) struct SignalTable {
    source: Signals,
    next_id: u64,
    callbacks: HashMap<i32, Vec<(u64, SignalCallback)>>,
}

impl SignalTable {
    pub(crate) fn new() -> Result<Self, RippleError> {
        let source =
            Signals::new([]).map_err(|e| RippleError::ReactorSetupFailure(e.to_string()))?;
        Ok(Self {
            source,
            next_id: 0,
            callbacks: HashMap::new(),
        })
    }

    pub(crate) fn register_source(&mut self, registry: &mio::Registry, token: Token) -> Result<(), RippleError> {
        registry
            .register(&mut self.source, token, mio::Interest::READABLE)
            .map_err(|e| RippleError::ReactorSetupFailure(e.to_string()))
    }

    pub(crate) fn setup(&mut self, signum: i32, cb: SignalCallback) -> Result<SignalHandle, RippleError> {
        if !self.callbacks.contains_key(&signum) {
            self.source
                .add_signal(signum)
                .map_err(|e| RippleError::ReactorSetupFailure(e.to_string()))?;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.entry(signum).or_default().push((id, cb));
        Ok(SignalHandle { signum, id })
    }

    pub(crate) fn cancel(&mut self, handle: SignalHandle) {
        if let Some(list) = self.callbacks.get_mut(&handle.signum) {
            list.retain(|(id, _)| *id != handle.id);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.values().all(|v| v.is_empty())
    }

    /// Takes ownership of the callback lists for every currently-pending
    /// signum, leaving the table's entries empty in the meantime. Callbacks
    /// themselves are meant to persist past a single firing (they are
    /// `FnMut`, re-armed implicitly), so the caller must feed the result
    /// back through `restore` once done invoking them — taking them out
    /// first lets a callback re-enter `setup_signal`/`cancel_signal`
    /// without re-borrowing anything still held by the dispatch loop.
    pub(crate) fn take_pending(&mut self) -> Vec<(i32, Vec<(u64, SignalCallback)>)> {
        let pending: Vec<i32> = self.source.pending().collect();
        let mut taken = Vec::new();
        for signum in pending {
            if let Some(list) = self.callbacks.get_mut(&signum) {
                if !list.is_empty() {
                    taken.push((signum, std::mem::take(list)));
                }
            }
        }
        taken
    }

    /// Puts callbacks previously removed by `take_pending` back, ahead of
    /// any new registrations for the same signum made while they were out.
    pub(crate) fn restore(&mut self, taken: Vec<(i32, Vec<(u64, SignalCallback)>)>) {
        for (signum, fired) in taken {
            let entry = self.callbacks.entry(signum).or_default();
            let mut merged = fired;
            merged.append(entry);
            *entry = merged;
        }
    }
}
