//! Anti-replay nonces.
//!
//! Exactly two nonces are live at any time: `current`, which is handed out in
//! challenges, and `previous`, which is still accepted so a client that read a
//! challenge just before a scheduled rotation can still answer it. A nonce
//! that has been consumed never validates again.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use indexmap::IndexSet;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const NONCE_BYTES: usize = 32;
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(30);
/// Shorter intervals are raised to this; a zero interval would stall the
/// timer task.
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(1);

/// Consumed nonces kept for replay detection before the oldest half is
/// dropped.
pub const CONSUMED_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce {
    pub value: String,
    pub issued_at_ms: i64,
    pub generation: u64,
}

#[derive(Debug)]
struct NonceState {
    current: Nonce,
    previous: Option<Nonce>,
    consumed: IndexSet<String>,
}

#[derive(Debug)]
pub struct NonceManager {
    state: Mutex<NonceState>,
    rotation_interval: Duration,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl NonceManager {
    pub fn new(rotation_interval: Duration) -> Self {
        Self {
            state: Mutex::new(NonceState {
                current: Nonce {
                    value: gen_nonce(),
                    issued_at_ms: Utc::now().timestamp_millis(),
                    generation: 0,
                },
                previous: None,
                consumed: IndexSet::new(),
            }),
            rotation_interval: rotation_interval.max(MIN_ROTATION_INTERVAL),
            rotation_task: Mutex::new(None),
        }
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    /// previous <- current, current <- fresh random value.
    pub fn rotate(&self) {
        let mut st = self.state.lock();
        Self::rotate_locked(&mut st);
    }

    fn rotate_locked(st: &mut NonceState) {
        let generation = st.current.generation + 1;
        let fresh = Nonce {
            value: gen_nonce(),
            issued_at_ms: Utc::now().timestamp_millis(),
            generation,
        };
        st.previous = Some(std::mem::replace(&mut st.current, fresh));

        if st.consumed.len() > CONSUMED_CAPACITY {
            let drop_n = st.consumed.len() / 2;
            st.consumed.drain(..drop_n);
            debug!(dropped = drop_n, "pruned consumed nonces");
        }
        debug!(generation, "nonce rotated");
    }

    /// Spawns the periodic rotation timer. A second call while the timer is
    /// running is a no-op.
    pub fn start_rotation(self: &Arc<Self>) {
        let mut task = self.rotation_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let interval = self.rotation_interval;
        let weak = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(mgr) = weak.upgrade() else { break };
                mgr.rotate();
            }
        }));
        info!(interval_ms = interval.as_millis() as u64, "nonce rotation started");
    }

    pub fn stop_rotation(&self) {
        if let Some(task) = self.rotation_task.lock().take() {
            task.abort();
            info!("nonce rotation stopped");
        }
    }

    pub fn current(&self) -> Nonce {
        self.state.lock().current.clone()
    }

    /// Accepts `nonce` at most once. On success it is recorded as consumed
    /// and the pair is rotated immediately.
    pub fn validate_and_consume(&self, nonce: &str) -> bool {
        let mut st = self.state.lock();

        if st.consumed.contains(nonce) {
            warn!("nonce replay detected");
            return false;
        }

        let live = st.current.value == nonce
            || st.previous.as_ref().is_some_and(|p| p.value == nonce);
        if !live {
            warn!("nonce matches neither current nor previous");
            return false;
        }

        st.consumed.insert(nonce.to_string());
        Self::rotate_locked(&mut st);
        true
    }

    #[cfg(test)]
    pub(crate) fn consumed_len(&self) -> usize {
        self.state.lock().consumed.len()
    }

    #[cfg(test)]
    pub(crate) fn previous(&self) -> Option<Nonce> {
        self.state.lock().previous.clone()
    }
}

impl Drop for NonceManager {
    fn drop(&mut self) {
        if let Some(task) = self.rotation_task.get_mut().take() {
            task.abort();
        }
    }
}

fn gen_nonce() -> String {
    let mut b = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut b);
    URL_SAFE_NO_PAD.encode(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_32_random_bytes() {
        let mgr = NonceManager::new(DEFAULT_ROTATION_INTERVAL);
        let raw = URL_SAFE_NO_PAD.decode(mgr.current().value).unwrap();
        assert_eq!(raw.len(), NONCE_BYTES);
    }

    #[test]
    fn consume_is_single_use_and_rotates() {
        let mgr = NonceManager::new(DEFAULT_ROTATION_INTERVAL);
        let n = mgr.current();
        assert!(mgr.validate_and_consume(&n.value));
        let after = mgr.current();
        assert_ne!(after.value, n.value);
        assert_eq!(after.generation, n.generation + 1);
        // consumed nonce is now `previous`, but still rejected
        assert_eq!(mgr.previous().unwrap().value, n.value);
        assert!(!mgr.validate_and_consume(&n.value));
    }

    #[test]
    fn previous_nonce_still_accepted_after_one_rotation() {
        let mgr = NonceManager::new(DEFAULT_ROTATION_INTERVAL);
        let n = mgr.current();
        mgr.rotate();
        assert!(mgr.validate_and_consume(&n.value));
    }

    #[test]
    fn nonce_two_rotations_old_is_rejected() {
        let mgr = NonceManager::new(DEFAULT_ROTATION_INTERVAL);
        let n = mgr.current();
        mgr.rotate();
        mgr.rotate();
        assert!(!mgr.validate_and_consume(&n.value));
        assert_eq!(mgr.consumed_len(), 0);
    }

    #[test]
    fn unknown_nonce_has_no_side_effects() {
        let mgr = NonceManager::new(DEFAULT_ROTATION_INTERVAL);
        let before = mgr.current();
        assert!(!mgr.validate_and_consume("not-a-nonce"));
        assert_eq!(mgr.current(), before);
        assert_eq!(mgr.consumed_len(), 0);
    }

    #[test]
    fn consumed_set_is_bounded() {
        let mgr = NonceManager::new(DEFAULT_ROTATION_INTERVAL);
        for _ in 0..250 {
            let n = mgr.current();
            assert!(mgr.validate_and_consume(&n.value));
        }
        assert!(mgr.consumed_len() <= CONSUMED_CAPACITY + 1);
    }

    #[test]
    fn concurrent_consumers_win_once() {
        let mgr = Arc::new(NonceManager::new(DEFAULT_ROTATION_INTERVAL));
        let n = mgr.current().value;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                let n = n.clone();
                std::thread::spawn(move || mgr.validate_and_consume(&n))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rotates_at_interval() {
        let mgr = Arc::new(NonceManager::new(Duration::from_secs(30)));
        let first = mgr.current();
        mgr.start_rotation();
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(mgr.current().generation, first.generation);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mgr.current().generation, first.generation + 1);
        assert_eq!(mgr.previous().unwrap().value, first.value);

        mgr.stop_rotation();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(mgr.current().generation, first.generation + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_rotates() {
        let mgr = Arc::new(NonceManager::new(Duration::ZERO));
        assert_eq!(mgr.rotation_interval(), MIN_ROTATION_INTERVAL);
        let first = mgr.current();
        mgr.start_rotation();
        tokio::time::sleep(MIN_ROTATION_INTERVAL + Duration::from_millis(500)).await;
        assert_eq!(mgr.current().generation, first.generation + 1);
    }
}
