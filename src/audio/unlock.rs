//! One-shot playback unlock.
//!
//! Hosts that only allow audio after a user gesture construct the gate
//! locked and call [`UnlockGate::unlock`] from the gesture handler. Playback
//! requested earlier waits at the gate instead of failing.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{PlayerError, Result};

#[derive(Debug, Clone)]
pub struct UnlockGate {
    tx: Arc<watch::Sender<bool>>,
}

impl UnlockGate {
    /// A gate that holds playback until [`Self::unlock`].
    pub fn locked() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A gate that never holds playback.
    pub fn unlocked() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn new(require_unlock: bool) -> Self {
        if require_unlock {
            Self::locked()
        } else {
            Self::unlocked()
        }
    }

    /// Open the gate. Returns `true` only for the call that opened it.
    pub fn unlock(&self) -> bool {
        let opened = self.tx.send_if_modified(|unlocked| {
            if *unlocked {
                false
            } else {
                *unlocked = true;
                true
            }
        });
        if opened {
            tracing::info!("audio playback unlocked");
        }
        opened
    }

    pub fn is_unlocked(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Interrupted`] if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(PlayerError::Interrupted),
            res = rx.wait_for(|unlocked| *unlocked) => res
                .map(|_| ())
                .map_err(|_| PlayerError::Channel("unlock gate closed".into())),
        }
    }
}
