use std::sync::atomic::{AtomicU8, Ordering};

/// The host's online/offline signal, where it has one.
pub trait Connectivity: Send + Sync {
    /// `None` when the environment exposes no signal.
    fn is_online(&self) -> Option<bool>;
}

/// For hosts without a connectivity signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConnectivitySignal;

impl Connectivity for NoConnectivitySignal {
    fn is_online(&self) -> Option<bool> {
        None
    }
}

const UNKNOWN: u8 = 0;
const ONLINE: u8 = 1;
const OFFLINE: u8 = 2;

/// Connectivity flag the shell flips from its online/offline events.
#[derive(Debug, Default)]
pub struct ConnectivityFlag {
    state: AtomicU8,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        let flag = Self::default();
        flag.set_online(online);
        flag
    }

    pub fn set_online(&self, online: bool) {
        self.state
            .store(if online { ONLINE } else { OFFLINE }, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.state.store(UNKNOWN, Ordering::SeqCst);
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> Option<bool> {
        match self.state.load(Ordering::SeqCst) {
            ONLINE => Some(true),
            OFFLINE => Some(false),
            _ => None,
        }
    }
}
