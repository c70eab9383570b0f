use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PoolResult;
use crate::kv::{Keys, KvStore};

/// A named lease held in the KV store. Released with a compare-and-delete on
/// the holder token, so a lease that expired and was taken over is left
/// alone.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    key: String,
    token: String,
}

pub struct Locker {
    kv: Arc<dyn KvStore>,
    keys: Keys,
}

impl Locker {
    pub fn new(kv: Arc<dyn KvStore>, keys: Keys) -> Self {
        Locker { kv, keys }
    }

    /// `None` when another holder has the lease.
    pub async fn obtain(&self, name: &str, ttl: Duration) -> PoolResult<Option<Lease>> {
        let key = self.keys.lease(name);
        let token = Uuid::new_v4().to_string();
        if self.kv.set_nx(&key, &token, ttl).await? {
            Ok(Some(Lease {
                name: name.to_string(),
                key,
                token,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(&self, lease: Lease) {
        match self.kv.compare_and_delete(&lease.key, &lease.token).await {
            Ok(true) => {}
            Ok(false) => {
                info!(target: "server_log", "lease {} expired before release", lease.name);
            }
            Err(e) => {
                warn!(target: "server_log", "failed to release lease {}: {:?}", lease.name, e);
            }
        }
    }

    pub fn bank_lease_name(chain: &str) -> String {
        format!("bank:{}", chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn locker() -> Locker {
        Locker::new(Arc::new(MemoryKv::new()), Keys::new("test"))
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let locker = locker();
        let lease = locker
            .obtain("blkunlock", Duration::from_secs(300))
            .await
            .unwrap()
            .expect("first obtain wins");
        assert!(locker
            .obtain("blkunlock", Duration::from_secs(300))
            .await
            .unwrap()
            .is_none());
        assert!(locker
            .obtain("trade", Duration::from_secs(300))
            .await
            .unwrap()
            .is_some());

        locker.release(lease).await;
        assert!(locker
            .obtain("blkunlock", Duration::from_secs(300))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_does_not_release_new_lease() {
        let locker = locker();
        let old = locker
            .obtain("bank:ETC", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let _new = locker
            .obtain("bank:ETC", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        locker.release(old).await;
        assert!(locker
            .obtain("bank:ETC", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }
}
