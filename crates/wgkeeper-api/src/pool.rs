// ── Bounded device connection pool ──
//
// At most `capacity` sessions per device. Sessions are dialed lazily on
// demand, handed out exclusively, and closed by a per-slot idle timer.
// All bookkeeping sits behind one mutex; dialing happens outside it with
// the slot already reserved so capacity is never exceeded.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::{ClientConfig, DeviceClient, Response};
use crate::error::Error;
use crate::proto::Command;

pub const DEFAULT_CAPACITY: usize = 5;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Pool sizing and the session parameters for every slot.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub client: ClientConfig,
    pub capacity: usize,
    pub idle_timeout: Duration,
}

impl PoolConfig {
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            capacity: DEFAULT_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Occupancy snapshot, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub in_use: usize,
}

/// A session checked out of the pool. Hand it back with [`ClientPool::release`].
#[derive(Debug)]
pub struct PooledClient {
    slot: u64,
    client: DeviceClient,
}

impl PooledClient {
    pub fn slot(&self) -> u64 {
        self.slot
    }
}

impl Deref for PooledClient {
    type Target = DeviceClient;

    fn deref(&self) -> &DeviceClient {
        &self.client
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut DeviceClient {
        &mut self.client
    }
}

struct Slot {
    id: u64,
    /// `None` while checked out or while the session is being dialed.
    client: Option<DeviceClient>,
    in_use: bool,
    last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    next_id: u64,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    cancel: CancellationToken,
}

/// Bounded set of sessions to one device. Cheaply cloneable.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.config.client.address
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Check out a session.
    ///
    /// Returns `Ok(None)` when every slot is busy: the pool neither blocks
    /// nor dials beyond capacity, so callers must handle the unavailable case.
    pub async fn acquire(&self) -> Result<Option<PooledClient>, Error> {
        let slot_id = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(Error::PoolClosed {
                    address: self.address().to_owned(),
                });
            }

            for slot in &mut state.slots {
                if slot.in_use {
                    continue;
                }
                if let Some(client) = slot.client.take() {
                    slot.in_use = true;
                    slot.last_used = Instant::now();
                    return Ok(Some(PooledClient {
                        slot: slot.id,
                        client,
                    }));
                }
            }

            if state.slots.len() >= self.capacity() {
                debug!(address = %self.address(), capacity = self.capacity(), "pool exhausted");
                return Ok(None);
            }

            let id = state.next_id;
            state.next_id += 1;
            state.slots.push(Slot {
                id,
                client: None,
                in_use: true,
                last_used: Instant::now(),
            });
            id
        };

        match DeviceClient::connect(&self.inner.config.client).await {
            Ok(client) => {
                self.spawn_idle_timer(slot_id);
                Ok(Some(PooledClient {
                    slot: slot_id,
                    client,
                }))
            }
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                state.slots.retain(|s| s.id != slot_id);
                Err(e)
            }
        }
    }

    /// Return a session to the free list.
    ///
    /// Broken sessions are discarded. Releasing a client this pool does not
    /// track is a programming error and is reported as
    /// [`Error::UntrackedClient`].
    pub async fn release(&self, pooled: PooledClient) -> Result<(), Error> {
        let PooledClient { slot: id, client } = pooled;
        let mut state = self.inner.state.lock().await;

        if state.closed {
            drop(state);
            client.close().await;
            return Ok(());
        }

        let Some(pos) = state.slots.iter().position(|s| s.id == id && s.in_use) else {
            drop(state);
            error!(address = %self.address(), slot = id, "released a client the pool does not track");
            client.close().await;
            return Err(Error::UntrackedClient {
                address: self.address().to_owned(),
                slot: id,
            });
        };

        if client.is_broken() {
            state.slots.remove(pos);
            drop(state);
            debug!(address = %self.address(), slot = id, "discarding broken session");
            client.close().await;
            return Ok(());
        }

        if let Some(slot) = state.slots.get_mut(pos) {
            slot.client = Some(client);
            slot.in_use = false;
            slot.last_used = Instant::now();
        }
        Ok(())
    }

    /// Acquire a session, run one command, and release the session even if
    /// the command failed.
    pub async fn run(&self, command: &Command) -> Result<Response, Error> {
        let Some(mut pooled) = self.acquire().await? else {
            return Err(Error::PoolExhausted {
                address: self.address().to_owned(),
                capacity: self.capacity(),
            });
        };
        let result = pooled.execute(command).await;
        self.release(pooled).await?;
        result
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            open: state.slots.len(),
            in_use: state.slots.iter().filter(|s| s.in_use).count(),
        }
    }

    /// Close every idle session and refuse further checkouts.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let slots = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.slots)
        };
        for slot in slots {
            if let Some(client) = slot.client {
                client.close().await;
            }
        }
        debug!(address = %self.address(), "pool closed");
    }

    fn spawn_idle_timer(&self, slot_id: u64) {
        let pool = Arc::downgrade(&self.inner);
        let idle = self.inner.config.idle_timeout;
        let cancel = self.inner.cancel.clone();
        tokio::spawn(idle_timer(pool, slot_id, idle, cancel));
    }
}

/// Close the slot once it has sat unused for `idle`; rearm while it is busy.
async fn idle_timer(pool: Weak<PoolInner>, slot_id: u64, idle: Duration, cancel: CancellationToken) {
    let mut wait = idle;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }

        let Some(inner) = pool.upgrade() else { return };
        let mut state = inner.state.lock().await;
        let Some(pos) = state.slots.iter().position(|s| s.id == slot_id) else {
            return;
        };
        let Some(slot) = state.slots.get(pos) else { return };

        if slot.in_use {
            wait = idle;
            continue;
        }
        let unused_for = slot.last_used.elapsed();
        if unused_for < idle {
            wait = idle.saturating_sub(unused_for);
            continue;
        }

        let slot = state.slots.remove(pos);
        drop(state);
        if let Some(client) = slot.client {
            client.close().await;
        }
        debug!(address = %inner.config.client.address, slot = slot_id, "evicted idle session");
        return;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, done, trap};

    fn pool_for(device: &FakeDevice, capacity: usize, idle: Duration) -> ClientPool {
        ClientPool::new(PoolConfig {
            client: device.client_config(),
            capacity,
            idle_timeout: idle,
        })
    }

    #[tokio::test]
    async fn dials_lazily_and_reuses_free_sessions() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let pool = pool_for(&device, 2, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(pool.stats().await, PoolStats { open: 0, in_use: 0 });

        let first = pool.acquire().await.unwrap().unwrap();
        let slot = first.slot();
        pool.release(first).await.unwrap();

        let again = pool.acquire().await.unwrap().unwrap();
        assert_eq!(again.slot(), slot);
        assert_eq!(device.connections(), 1);
        pool.release(again).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_pool_reports_unavailable() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let pool = pool_for(&device, 1, DEFAULT_IDLE_TIMEOUT);

        let held = pool.acquire().await.unwrap().unwrap();
        assert!(pool.acquire().await.unwrap().is_none());

        let err = pool.run(&Command::new("/system/resource/print")).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { capacity: 1, .. }));

        pool.release(held).await.unwrap();
        assert!(pool.acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn releasing_untracked_client_fails_loudly() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let pool_a = pool_for(&device, 2, DEFAULT_IDLE_TIMEOUT);
        let pool_b = pool_for(&device, 2, DEFAULT_IDLE_TIMEOUT);

        let foreign = pool_a.acquire().await.unwrap().unwrap();
        let err = pool_b.release(foreign).await.unwrap_err();
        assert!(matches!(err, Error::UntrackedClient { .. }));
    }

    #[tokio::test]
    async fn run_releases_after_device_error() {
        let device = FakeDevice::start(|_| vec![trap("no such item"), done()]).await;
        let pool = pool_for(&device, 1, DEFAULT_IDLE_TIMEOUT);

        let err = pool
            .run(&Command::new("/interface/wireguard/peers/remove").attr(".id", "*1"))
            .await
            .unwrap_err();
        assert!(err.is_no_such_item());
        assert_eq!(pool.stats().await, PoolStats { open: 1, in_use: 0 });
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_busy_ones_kept() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let pool = pool_for(&device, 2, Duration::from_millis(100));

        let busy = pool.acquire().await.unwrap().unwrap();
        let idle = pool.acquire().await.unwrap().unwrap();
        pool.release(idle).await.unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(pool.stats().await, PoolStats { open: 1, in_use: 1 });

        pool.release(busy).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(pool.stats().await, PoolStats { open: 0, in_use: 0 });
    }

    #[tokio::test]
    async fn closed_pool_refuses_checkout() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let pool = pool_for(&device, 2, DEFAULT_IDLE_TIMEOUT);
        let held = pool.acquire().await.unwrap().unwrap();

        pool.close().await;
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed { .. })));
        pool.release(held).await.unwrap();
        assert_eq!(pool.stats().await, PoolStats { open: 0, in_use: 0 });
    }
}
