use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{
    DiskLimitTimeout, DiskLimiter, JournalError, JournalResult, JournalServiceConfig, UserOrTeamId,
};

#[derive(Default)]
struct LimiterUsage {
    total: u64,
    by_owner: HashMap<UserOrTeamId, u64>,
}

/// Byte budget shared by every journal in the process. A `limit_bytes` of
/// zero disables the limit but still tracks usage.
pub struct LocalDiskLimiter {
    limit_bytes: u64,
    timeout: Duration,
    usage: Mutex<LimiterUsage>,
    freed: Notify,
}

impl LocalDiskLimiter {
    pub fn new(limit_bytes: u64, timeout: Duration) -> Self {
        Self {
            limit_bytes,
            timeout,
            usage: Mutex::new(LimiterUsage::default()),
            freed: Notify::new(),
        }
    }

    pub fn from_config(config: &JournalServiceConfig) -> Self {
        Self::new(config.disk_limit_bytes, config.disk_limit_timeout())
    }

    pub fn used_bytes(&self) -> u64 {
        self.usage.lock().map(|u| u.total).unwrap_or_default()
    }

    fn try_reserve(&self, charged_to: &UserOrTeamId, bytes: u64) -> JournalResult<Option<u64>> {
        let mut usage = self
            .usage
            .lock()
            .map_err(|_| JournalError::InvalidState("disk limiter lock poisoned".to_string()))?;
        if self.limit_bytes == 0 || usage.total.saturating_add(bytes) <= self.limit_bytes {
            usage.total += bytes;
            *usage.by_owner.entry(charged_to.clone()).or_default() += bytes;
            return Ok(None);
        }
        Ok(Some(self.limit_bytes.saturating_sub(usage.total)))
    }
}

#[async_trait]
impl DiskLimiter for LocalDiskLimiter {
    async fn reserve(&self, charged_to: &UserOrTeamId, bytes: u64) -> JournalResult<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let notified = self.freed.notified();
            let available = match self.try_reserve(charged_to, bytes)? {
                None => return Ok(()),
                Some(available) => available,
            };
            debug!(
                "disk limiter waiting: {} requested, {} available",
                bytes, available
            );
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(JournalError::DiskLimitTimeout(DiskLimitTimeout {
                    timeout: self.timeout,
                    requested_bytes: bytes,
                    available_bytes: available,
                    reportable: false,
                }));
            }
        }
    }

    fn on_stored(&self, charged_to: &UserOrTeamId, bytes: u64) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.total += bytes;
            *usage.by_owner.entry(charged_to.clone()).or_default() += bytes;
        }
    }

    fn release(&self, charged_to: &UserOrTeamId, bytes: u64) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.total = usage.total.saturating_sub(bytes);
            let remaining = usage.by_owner.get_mut(charged_to).map(|owned| {
                *owned = owned.saturating_sub(bytes);
                *owned
            });
            if remaining == Some(0) {
                usage.by_owner.remove(charged_to);
            }
        }
        self.freed.notify_waiters();
    }

    fn status(&self, charged_to: Option<&UserOrTeamId>) -> serde_json::Value {
        let usage = match self.usage.lock() {
            Ok(usage) => usage,
            Err(_) => return json!({ "error": "disk limiter lock poisoned" }),
        };
        let owner_bytes = charged_to
            .and_then(|owner| usage.by_owner.get(owner).copied())
            .unwrap_or(0);
        json!({
            "type": "local",
            "limit_bytes": self.limit_bytes,
            "used_bytes": usage.total,
            "owner_used_bytes": owner_bytes,
            "timeout_ms": self.timeout.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reserve_times_out_when_full() {
        let limiter = LocalDiskLimiter::new(100, Duration::from_millis(20));
        let owner = UserOrTeamId::User(UserId::random());
        limiter.reserve(&owner, 80).await.unwrap();

        match limiter.reserve(&owner, 40).await {
            Err(JournalError::DiskLimitTimeout(err)) => {
                assert_eq!(err.requested_bytes, 40);
                assert_eq!(err.available_bytes, 20);
                assert!(!err.reportable);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(limiter.used_bytes(), 80);
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let limiter = Arc::new(LocalDiskLimiter::new(100, Duration::from_secs(5)));
        let owner = UserOrTeamId::User(UserId::random());
        limiter.reserve(&owner, 100).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let owner = owner.clone();
            tokio::spawn(async move { limiter.reserve(&owner, 50).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        limiter.release(&owner, 60);
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.used_bytes(), 90);
        assert_eq!(limiter.status(Some(&owner))["owner_used_bytes"], 90);
    }
}
