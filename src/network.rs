// SPDX-License-Identifier: MIT

//! Network reachability signal
//!
//! A `watch` channel holding the latest known state. Producers (a platform
//! probe, tests) call `set_reachable`; the draft store subscribes to learn
//! about transitions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Reachable,
    Unreachable,
}

impl NetworkState {
    pub fn is_reachable(self) -> bool {
        self == NetworkState::Reachable
    }
}

/// Owner side of the reachability signal
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkState>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a state; repeated identical states are not re-broadcast
    pub fn set_reachable(&self, reachable: bool) {
        let next = if reachable {
            NetworkState::Reachable
        } else {
            NetworkState::Unreachable
        };
        let changed = self.tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            log::info!("Network state changed: {:?}", next);
        }
    }

    pub fn state(&self) -> NetworkState {
        *self.tx.borrow()
    }

    pub fn is_reachable(&self) -> bool {
        self.state().is_reachable()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }

    /// Stream of states, starting with the current one
    pub fn stream(&self) -> WatchStream<NetworkState> {
        WatchStream::new(self.subscribe())
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkState::Reachable)
    }
}
