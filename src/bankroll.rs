//! Bankroll provider.
//!
//! The bankroll is owned outside the detection core. The core only reads
//! it as an upper bound on stake sizing and subscribes to changes so the
//! opportunity lists can be recomputed.

use tokio::sync::watch;
use tracing::info;

/// Read-only view of the user's current bankroll.
#[cfg_attr(test, mockall::automock)]
pub trait BankrollProvider: Send + Sync {
    fn bankroll(&self) -> f64;

    /// Change notifications. The receiver always holds the latest value.
    fn watch(&self) -> watch::Receiver<f64>;
}

/// In-process bankroll backed by a watch channel.
pub struct SharedBankroll {
    tx: watch::Sender<f64>,
}

impl SharedBankroll {
    pub fn new(initial: f64) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new amount. Subscribers are only woken on an actual change.
    pub fn set(&self, amount: f64) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == amount {
                false
            } else {
                *current = amount;
                true
            }
        });
        if changed {
            info!(bankroll = format!("${:.2}", amount), "Bankroll updated");
        }
    }
}

impl BankrollProvider for SharedBankroll {
    fn bankroll(&self) -> f64 {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<f64> {
        self.tx.subscribe()
    }
}
