//! Replica client
//!
//! Wraps the transport to one replica with a bounded retry policy. Every
//! attempt carries a timeout; timeouts and other transient transport
//! failures are retried with exponential backoff and jitter. A replica that
//! still fails after the last attempt is reported as `ReplicaUnavailable`.
//! Consistency semantics live one layer up.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use replvol_common::{BlockIndex, Generation, ReplicaConfig, ReplicaId, VolumeName};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{VolumeError, VolumeResult};
use crate::stats::{FaultEvent, FaultSignal, VolumeStats};
use crate::transport::{BlockData, ReplicaTransport, TransportError};

/// Consecutive failed operations before a `ReplicaFailing` fault is raised
pub const FAILING_THRESHOLD: u32 = 3;

/// Retrying client for one volume's blocks on a single replica
pub struct ReplicaClient {
    id: ReplicaId,
    volume: VolumeName,
    transport: Arc<dyn ReplicaTransport>,
    config: ReplicaConfig,
    /// Bounds requests in flight on this replica's channel
    queue: Semaphore,
    failure_streak: AtomicU32,
    stats: Arc<VolumeStats>,
    faults: FaultSignal,
}

impl ReplicaClient {
    pub fn new(
        id: ReplicaId,
        volume: VolumeName,
        transport: Arc<dyn ReplicaTransport>,
        config: ReplicaConfig,
        stats: Arc<VolumeStats>,
        faults: FaultSignal,
    ) -> Self {
        let queue = Semaphore::new(config.max_in_flight.max(1));
        Self {
            id,
            volume,
            transport,
            config,
            queue,
            failure_streak: AtomicU32::new(0),
            stats,
            faults,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ReplicaId {
        &self.id
    }

    /// Read a whole block
    pub async fn read(&self, block: BlockIndex) -> VolumeResult<BlockData> {
        let (transport, volume) = (&self.transport, &self.volume);
        let result = self
            .with_retry("read", block, move || transport.read_block(volume, block))
            .await;
        self.finish(result, block, 0)
    }

    /// Write a whole block at `generation`
    ///
    /// A replica that already holds a newer generation yields
    /// `StaleGeneration` carrying the replica's generation.
    pub async fn write(
        &self,
        block: BlockIndex,
        generation: Generation,
        data: Bytes,
    ) -> VolumeResult<()> {
        let (transport, volume) = (&self.transport, &self.volume);
        let result = self
            .with_retry("write", block, move || {
                transport.write_block(volume, block, generation, data.clone())
            })
            .await;
        self.finish(result, block, generation)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        block: BlockIndex,
        mut attempt_fn: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;
        loop {
            let result = {
                let _permit = self
                    .queue
                    .acquire()
                    .await
                    .map_err(|_| TransportError::Unreachable("request queue closed".into()))?;
                tokio::time::timeout(self.config.request_timeout, attempt_fn())
                    .await
                    .unwrap_or(Err(TransportError::Timeout))
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = jittered(backoff).min(self.config.max_backoff);
                    debug!(
                        replica = %self.id,
                        block,
                        attempt,
                        "{op} failed: {e}, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2).min(self.config.max_backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finish<T>(
        &self,
        result: Result<T, TransportError>,
        block: BlockIndex,
        generation: Generation,
    ) -> VolumeResult<T> {
        match result {
            Ok(value) => {
                self.failure_streak.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Err(TransportError::Stale { current }) => {
                // The replica answered; it is healthy, just ahead of us
                self.failure_streak.store(0, Ordering::Relaxed);
                Err(VolumeError::StaleGeneration {
                    block,
                    attempted: generation,
                    committed: current,
                })
            }
            Err(e) => {
                self.stats.record_replica_failure();
                let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
                if streak == FAILING_THRESHOLD {
                    warn!(replica = %self.id, "replica failed {streak} operations in a row");
                    self.faults.emit(FaultEvent::ReplicaFailing {
                        replica: self.id.clone(),
                        consecutive_failures: streak,
                    });
                }
                Err(VolumeError::ReplicaUnavailable {
                    replica: self.id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Add up to 50% random jitter to a backoff delay
fn jittered(delay: Duration) -> Duration {
    let max_extra = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    if max_extra == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=max_extra);
    delay + Duration::from_millis(extra)
}
