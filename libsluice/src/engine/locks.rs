use crate::engine::EngineError;
use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-channel exclusive locks. Update processing on one channel is single-file; unrelated
/// channels proceed in parallel. Acquisition is bounded by the protocol message timeout so a
/// stuck critical section cannot wedge a channel forever.
#[derive(Default)]
pub struct ChannelLocks {
    inner: StdMutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        ChannelLocks::default()
    }

    pub async fn acquire(&self, channel: Address, ttl: Duration) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = {
            let mut map = self.inner.lock().expect("lock map is never poisoned");
            Arc::clone(map.entry(channel).or_default())
        };
        tokio::time::timeout(ttl, lock.lock_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(channel))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn serializes_one_channel() {
        let locks = ChannelLocks::new();
        let channel = Address::repeat_byte(1);
        let guard = locks.acquire(channel, Duration::from_millis(50)).await.unwrap();
        let err = locks.acquire(channel, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout(c) if c == channel));
        drop(guard);
        locks.acquire(channel, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn distinct_channels_do_not_contend() {
        let locks = ChannelLocks::new();
        let _first = locks.acquire(Address::repeat_byte(1), Duration::from_millis(50)).await.unwrap();
        let _second = locks.acquire(Address::repeat_byte(2), Duration::from_millis(50)).await.unwrap();
    }
}
