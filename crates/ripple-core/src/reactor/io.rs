//! fd-readiness watches backing `Reactor::setup_io`/`update_io`/`cancel_io`.

use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::error::RippleError;

/// Subset of `{READ, WRITE}` a watch is interested in. A thin bitflag type
/// standing in for the spec's `READ`/`WRITE` integer constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoInterest(u8);

impl IoInterest {
    pub const NONE: IoInterest = IoInterest(0);
    pub const READ: IoInterest = IoInterest(0b01);
    pub const WRITE: IoInterest = IoInterest(0b10);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: IoInterest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(IoInterest::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(IoInterest::WRITE)
    }

    pub(crate) fn to_mio_interest(self) -> Option<Interest> {
        match (self.readable(), self.writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for IoInterest {
    type Output = IoInterest;
    fn bitor(self, rhs: Self) -> Self::Output {
        IoInterest(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoInterest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Opaque handle returned by [`super::Reactor::setup_io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle(pub(crate) usize);

/// Event delivered to an I/O callback: either the ready subset of the
/// registered mask, or a reactor-local error for that fd.
pub enum IoEvent {
    Ready(IoInterest),
    Error(RippleError),
}

pub(crate) type IoCallback = Box<dyn FnMut(IoEvent)>;

pub(crate) struct IoWatch {
    pub(crate) fd: RawFd,
    pub(crate) interest: IoInterest,
    // `None` only while a fired callback is out on loan to the dispatch
    // loop — see `Reactor::take_ready_io`/`restore_io`.
    pub(crate) callback: Option<IoCallback>,
    pub(crate) registered: bool,
}

impl IoWatch {
    pub(crate) fn register(&mut self, registry: &mio::Registry, token: Token) -> Result<(), RippleError> {
        if let Some(interest) = self.interest.to_mio_interest() {
            registry
                .register(&mut SourceFd(&self.fd), token, interest)
                .map_err(|e| RippleError::ReactorSetupFailure(e.to_string()))?;
            self.registered = true;
        }
        Ok(())
    }

    pub(crate) fn reregister(&mut self, registry: &mio::Registry, token: Token) -> Result<(), RippleError> {
        match (self.registered, self.interest.to_mio_interest()) {
            (true, Some(interest)) => registry
                .reregister(&mut SourceFd(&self.fd), token, interest)
                .map_err(|e| RippleError::ReactorSetupFailure(e.to_string())),
            (true, None) => {
                let _ = registry.deregister(&mut SourceFd(&self.fd));
                self.registered = false;
                Ok(())
            }
            (false, Some(interest)) => {
                registry
                    .register(&mut SourceFd(&self.fd), token, interest)
                    .map_err(|e| RippleError::ReactorSetupFailure(e.to_string()))?;
                self.registered = true;
                Ok(())
            }
            (false, None) => Ok(()),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) {
        if self.registered {
            let _ = registry.deregister(&mut SourceFd(&self.fd));
            self.registered = false;
        }
    }
}
