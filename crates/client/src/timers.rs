//! Keyed timers owned by the connection actor
//!
//! Each timer is a spawned task that posts a [`TimerFired`] back to the actor.
//! Re-arming a key aborts the previous task and bumps the token, so a fire
//! that was already queued from the old task is recognised as stale.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scheduler::ApprovalKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Heartbeat,
    Reconnect,
    Countdown(ApprovalKey),
    Retry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    pub token: u64,
}

struct Armed {
    token: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

pub struct Timers {
    next_token: u64,
    active: HashMap<TimerKey, Armed>,
    tx: mpsc::Sender<TimerFired>,
}

impl Timers {
    pub fn new(tx: mpsc::Sender<TimerFired>) -> Self {
        Self {
            next_token: 0,
            active: HashMap::new(),
            tx,
        }
    }

    /// Fire once after `delay`.
    pub fn once(&mut self, key: TimerKey, delay: Duration) {
        let token = self.take_token();
        let tx = self.tx.clone();
        let fired = TimerFired {
            key: key.clone(),
            token,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired).await;
        });
        self.arm(key, token, false, handle);
    }

    /// Fire every `period`, first one period from now.
    pub fn every(&mut self, key: TimerKey, period: Duration) {
        let token = self.take_token();
        let tx = self.tx.clone();
        let fired = TimerFired {
            key: key.clone(),
            token,
        };
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(fired.clone()).await.is_err() {
                    break;
                }
            }
        });
        self.arm(key, token, true, handle);
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.active.remove(key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether `fired` belongs to the timer currently armed under its key.
    /// One-shot timers are disarmed by the fire they accept.
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        let Some(armed) = self.active.get(&fired.key) else {
            return false;
        };
        if armed.token != fired.token {
            return false;
        }
        if !armed.repeating {
            self.active.remove(&fired.key);
        }
        true
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.active.drain() {
            armed.handle.abort();
        }
    }

    fn take_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn arm(&mut self, key: TimerKey, token: u64, repeating: bool, handle: JoinHandle<()>) {
        if let Some(previous) = self.active.insert(
            key,
            Armed {
                token,
                repeating,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
