//! Active Link Cell
//!
//! Holds the link the client side currently forwards through. The connector
//! writes it from link state transitions; every forwarding task reads it.

use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use super::{ArcPeerLink, LinkId, LinkState};
use crate::config::LINK_POLL_INTERVAL;
use crate::error::{PortLinkError, Result};

/// Shared reference to the currently connected link, if any
pub struct ActiveLinkRef {
    current: RwLock<Option<ArcPeerLink>>,
    state_tx: watch::Sender<LinkState>,
}

impl Default for ActiveLinkRef {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveLinkRef {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        Self {
            current: RwLock::new(None),
            state_tx,
        }
    }

    /// The stored link, regardless of its current state
    pub fn current(&self) -> Option<ArcPeerLink> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The stored link if it is connected right now
    pub fn connected(&self) -> Option<ArcPeerLink> {
        self.current()
            .filter(|link| link.state() == LinkState::Connected)
    }

    /// State of the link held by the cell, `Idle` when empty
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Receiver notified whenever the cell changes
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Applies a state transition reported by `link`.
    ///
    /// `Connected` installs the link. `Failed`/`Closed` clear the cell only if
    /// it still holds this very link, so a late report from a superseded
    /// attempt cannot evict a newer one.
    pub fn observe(&self, link: &ArcPeerLink, state: LinkState) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match state {
            LinkState::Connected => {
                *current = Some(link.clone());
                self.state_tx.send_replace(LinkState::Connected);
            }
            LinkState::Failed | LinkState::Closed => {
                if current.as_ref().map(|l| l.id()) == Some(link.id()) {
                    *current = None;
                    self.state_tx.send_replace(state);
                } else {
                    debug!("Ignoring {} report from superseded {}", state, link.id());
                }
            }
            LinkState::Idle | LinkState::Connecting => {
                if current.as_ref().map(|l| l.id()) == Some(link.id()) {
                    self.state_tx.send_replace(state);
                }
            }
        }
    }

    /// Clears the cell if it holds the link with `id`
    pub fn clear_if(&self, id: LinkId) -> bool {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref().map(|l| l.id()) == Some(id) {
            *current = None;
            self.state_tx.send_replace(LinkState::Closed);
            true
        } else {
            false
        }
    }

    /// Waits up to `timeout` for a connected link.
    ///
    /// Re-checks on every cell change and at least every
    /// [`LINK_POLL_INTERVAL`], so a link whose own state flips without a
    /// report reaching the cell is still noticed.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<ArcPeerLink> {
        let mut changes = self.subscribe();
        let wait = async {
            loop {
                if let Some(link) = self.connected() {
                    return link;
                }
                tokio::select! {
                    _ = changes.changed() => {}
                    _ = tokio::time::sleep(LINK_POLL_INTERVAL) => {}
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PortLinkError::LinkNotReady)
    }
}
