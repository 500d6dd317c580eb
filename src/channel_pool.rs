//! Bounded pool of confirm-capable channels leased over a single
//! connection. Holds idle channels in a `Vec` with min/max bounds, acquires
//! via a `tokio::sync::Semaphore` permit for the timeout wait, and releases
//! FIFO through the semaphore's own wait queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lapin::options::ConfirmSelectOptions;
use lapin::Channel;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::config::ChannelPoolConfig;
use crate::connection::ConnectionManager;
use crate::error::ChannelError;

struct PooledChannel {
    channel: Channel,
    idle_since: Instant,
}

struct Inner {
    idle: Vec<PooledChannel>,
    in_use: usize,
    draining: bool,
}

/// A leased channel, returned to the pool's idle list on drop.
pub struct Lease {
    channel: Option<Channel>,
    pool: Arc<PoolState>,
}

impl std::ops::Deref for Lease {
    type Target = Channel;
    fn deref(&self) -> &Channel {
        self.channel.as_ref().expect("channel taken only on drop")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                pool.release(channel).await;
            });
        }
    }
}

struct PoolState {
    connection: Arc<ConnectionManager>,
    config: ChannelPoolConfig,
    inner: Mutex<Inner>,
    semaphore: Semaphore,
}

impl PoolState {
    async fn release(&self, channel: Channel) {
        let mut inner = self.inner.lock().await;
        inner.in_use = inner.in_use.saturating_sub(1);
        if inner.draining || !channel.status().connected() {
            let _ = channel.close(0, "releasing unhealthy channel").await;
        } else {
            inner.idle.push(PooledChannel {
                channel,
                idle_since: Instant::now(),
            });
        }
        self.semaphore.add_permits(1);
    }
}

/// Leases logical channels with health checks and idle eviction.
pub struct ChannelPool {
    state: Arc<PoolState>,
    evictor: tokio::task::JoinHandle<()>,
}

impl ChannelPool {
    pub fn new(connection: Arc<ConnectionManager>, config: ChannelPoolConfig) -> Self {
        let state = Arc::new(PoolState {
            connection,
            config,
            inner: Mutex::new(Inner {
                idle: Vec::new(),
                in_use: 0,
                draining: false,
            }),
            semaphore: Semaphore::new(config.max_size),
        });
        let evictor = spawn_evictor(Arc::clone(&state));
        Self { state, evictor }
    }

    /// Returns a healthy idle channel, opens a new one below `max_size`, or
    /// suspends up to `acquire_timeout` and fails with `AcquireTimeout`.
    pub async fn acquire(&self) -> Result<Lease, ChannelError> {
        {
            let inner = self.state.inner.lock().await;
            if inner.draining {
                return Err(ChannelError::PoolDraining);
            }
        }

        let permit = tokio::time::timeout(
            self.state.config.acquire_timeout,
            self.state.semaphore.acquire(),
        )
        .await
        .map_err(|_| ChannelError::AcquireTimeout)?
        .expect("semaphore is never closed while the pool is alive");
        permit.forget();

        let existing = {
            let mut inner = self.state.inner.lock().await;
            let found = loop {
                match inner.idle.pop() {
                    Some(pooled) if pooled.channel.status().connected() => break Some(pooled.channel),
                    Some(_) => continue,
                    None => break None,
                }
            };
            if found.is_some() {
                inner.in_use += 1;
            }
            found
        };

        let channel = match existing {
            Some(channel) => channel,
            None => {
                let channel = self
                    .state
                    .connection
                    .create_channel()
                    .await
                    .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
                let mut inner = self.state.inner.lock().await;
                inner.in_use += 1;
                channel
            }
        };

        Ok(Lease {
            channel: Some(channel),
            pool: Arc::clone(&self.state),
        })
    }

    /// Stops new acquires, rejects the semaphore's pending waiters, waits
    /// for in-use channels to be released up to `bound`, then closes the
    /// remainder.
    pub async fn drain(&self, bound: Duration) {
        {
            let mut inner = self.state.inner.lock().await;
            inner.draining = true;
        }
        let deadline = Instant::now() + bound;
        loop {
            let in_use = self.state.inner.lock().await.in_use;
            if in_use == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let mut inner = self.state.inner.lock().await;
        for pooled in inner.idle.drain(..) {
            let _ = pooled.channel.close(0, "pool drained").await;
        }
        self.evictor.abort();
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        self.evictor.abort();
    }
}

/// Whether the `considered`-th idle channel (0-indexed, in closing order)
/// should be evicted: it survives if keeping it is still needed to reach
/// `min_size`, or if it hasn't been idle long enough yet.
fn should_evict(considered: usize, in_use: usize, min_size: usize, idle_for: Duration, idle_timeout: Duration) -> bool {
    if considered + in_use < min_size {
        return false;
    }
    idle_for >= idle_timeout
}

fn spawn_evictor(state: Arc<PoolState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.eviction_interval);
        loop {
            ticker.tick().await;
            let mut inner = state.inner.lock().await;
            if inner.draining {
                break;
            }
            let min_size = state.config.min_size;
            let idle_timeout = state.config.idle_timeout;
            let in_use = inner.in_use;
            let mut kept = Vec::new();
            let mut to_close = Vec::new();
            for pooled in inner.idle.drain(..) {
                if should_evict(kept.len(), in_use, min_size, pooled.idle_since.elapsed(), idle_timeout) {
                    to_close.push(pooled);
                } else {
                    kept.push(pooled);
                }
            }
            inner.idle = kept;
            drop(inner);
            for pooled in to_close {
                debug!("evicting idle channel");
                let _ = pooled.channel.close(0, "idle eviction").await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_channels_needed_to_reach_min_size() {
        assert!(!should_evict(0, 0, 2, Duration::from_secs(999), Duration::from_secs(1)));
        assert!(!should_evict(1, 0, 2, Duration::from_secs(999), Duration::from_secs(1)));
    }

    #[test]
    fn evicts_beyond_min_size_once_idle_timeout_elapses() {
        assert!(should_evict(2, 0, 2, Duration::from_secs(999), Duration::from_secs(1)));
    }

    #[test]
    fn keeps_fresh_channels_even_beyond_min_size() {
        assert!(!should_evict(5, 0, 2, Duration::from_millis(1), Duration::from_secs(60)));
    }

    #[test]
    fn in_use_channels_count_toward_min_size() {
        assert!(!should_evict(0, 2, 2, Duration::from_secs(999), Duration::from_secs(1)));
    }
}
