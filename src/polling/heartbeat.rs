// Heartbeat - periodically restarts sources that should be polling but aren't
// Auth-blocked sources are left alone, they need a human

use super::Poller;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, Instrument, Span};

pub struct Heartbeat {
    pollers: Vec<Poller>,
    interval: Duration,
    span: Span,
}

impl Heartbeat {
    pub fn new(pollers: Vec<Poller>, interval: Duration, span: Span) -> Self {
        Self { pollers, interval, span }
    }

    /// One pass. Returns the names of the sources it restarted.
    pub fn check(&self) -> Vec<String> {
        let _entered = self.span.enter();
        let mut restarted = Vec::new();

        for poller in &self.pollers {
            if !poller.should_poll() || poller.is_polling() || poller.auth_blocked() {
                continue;
            }
            if poller.start_polling().is_some() {
                info!("heartbeat restarted {}", poller.identity());
                restarted.push(poller.identity().name.clone());
            }
        }
        restarted
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    self.check();
                }
            }
            .instrument(span),
        )
    }
}
