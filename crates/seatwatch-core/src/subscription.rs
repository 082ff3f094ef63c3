//! Reference-counted signal subscriptions with non-blocking fan-out.
//!
//! A [`Subscription`] tracks every listener interested in one signal kind
//! and whether the matching rule is currently registered with the bus.
//! The rule is added when the first listener arrives and removed when the
//! last one leaves, so N listeners cost exactly one match.
//!
//! A facility keeps all of its subscriptions behind one mutex, so that
//! incoming signals are matched and fanned out atomically with respect to
//! concurrent subscribe and unsubscribe calls.

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::bus::{BusConnection, MatchRule};
use crate::error::{Error, Result};

/// Outcome of fanning one value out to every listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Listeners whose buffer was full; the value was dropped for them only.
    pub dropped: usize,
    /// Listeners whose receiver was gone; they have been removed.
    pub pruned: usize,
}

/// Listeners for one signal kind.
#[derive(Debug)]
pub struct Subscription<T> {
    rule: MatchRule,
    subscribers: Vec<mpsc::Sender<T>>,
    /// True while `rule` is registered with the bus.
    active: bool,
}

impl<T: Clone> Subscription<T> {
    pub fn new(rule: MatchRule) -> Self {
        Self {
            rule,
            subscribers: Vec::new(),
            active: false,
        }
    }

    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, tx: &mpsc::Sender<T>) -> bool {
        self.subscribers.iter().any(|s| s.same_channel(tx))
    }

    /// Adds `tx` as a listener, registering the match first if needed.
    ///
    /// Adding a channel that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// - `Error::SubscriberClosed` if the receiving half is gone
    /// - `Error::Transport` if registering the match fails; nothing is added
    pub async fn subscribe(&mut self, bus: &dyn BusConnection, tx: mpsc::Sender<T>) -> Result<()> {
        if tx.is_closed() {
            return Err(Error::SubscriberClosed);
        }

        if !self.active {
            bus.add_match(&self.rule).await.map_err(|e| {
                Error::transport(
                    format!("failed to register {} signal", self.rule.member),
                    e,
                )
            })?;
            self.active = true;
            debug!(member = %self.rule.member, path = %self.rule.path, "Signal match added");
        }

        if !self.contains(&tx) {
            self.subscribers.push(tx);
        }

        Ok(())
    }

    /// Removes `tx`; safe for channels that were never added.
    ///
    /// When the last listener leaves the match is removed from the bus.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if removing the match fails. The listener stays removed.
    pub async fn unsubscribe(&mut self, bus: &dyn BusConnection, tx: &mpsc::Sender<T>) -> Result<()> {
        self.subscribers.retain(|s| !s.same_channel(tx));

        if self.subscribers.is_empty() {
            self.release(bus).await?;
        }

        Ok(())
    }

    /// Removes the match from the bus if it is registered and nobody listens.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if removing the match fails; the match stays recorded as active
    pub async fn release(&mut self, bus: &dyn BusConnection) -> Result<()> {
        if !self.active || !self.subscribers.is_empty() {
            return Ok(());
        }

        bus.remove_match(&self.rule).await.map_err(|e| {
            Error::transport(format!("failed to remove {} signal", self.rule.member), e)
        })?;
        self.active = false;
        debug!(member = %self.rule.member, path = %self.rule.path, "Signal match removed");

        Ok(())
    }

    /// Drops every listener and removes the match.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if removing the match fails
    pub async fn clear(&mut self, bus: &dyn BusConnection) -> Result<()> {
        self.subscribers.clear();
        self.release(bus).await
    }

    /// Offers `value` to every listener without waiting.
    ///
    /// A full listener misses this value; a closed one is removed. The
    /// caller should [`release`](Self::release) afterwards if pruning
    /// emptied the set.
    pub fn fan_out(&mut self, value: T) -> Delivery {
        let mut delivery = Delivery::default();

        self.subscribers.retain(|tx| match tx.try_send(value.clone()) {
            Ok(()) => {
                delivery.delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                delivery.dropped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                delivery.pruned += 1;
                false
            }
        });

        if delivery.dropped > 0 {
            trace!(
                member = %self.rule.member,
                dropped = delivery.dropped,
                "Listener buffer full, value dropped"
            );
        }
        if delivery.pruned > 0 {
            warn!(
                member = %self.rule.member,
                pruned = delivery.pruned,
                "Removed listeners whose receiver was dropped"
            );
        }

        delivery
    }

    /// [`fan_out`](Self::fan_out), then drops the match if pruning left nobody listening.
    pub async fn deliver(&mut self, bus: &dyn BusConnection, value: T) -> Delivery {
        let delivery = self.fan_out(value);

        if delivery.pruned > 0 {
            if let Err(e) = self.release(bus).await {
                warn!(member = %self.rule.member, error = %e, "Failed to release match after pruning");
            }
        }

        delivery
    }
}
