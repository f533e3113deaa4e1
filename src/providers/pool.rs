//! Process-wide provider pool.
//!
//! Provider sets are expensive to build (vendor connections, warmed
//! models), so the process keeps `{min..max}` of them and hands one to each
//! session for its lifetime. A maintenance task refills the idle set on an
//! interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::PoolSizing;
use crate::errors::ProviderError;
use crate::providers::ProviderSet;

/// Factory building a fresh provider set.
pub type ProviderFactory = Arc<dyn Fn() -> anyhow::Result<ProviderSet> + Send + Sync>;

/// Sized pool of provider sets.
pub struct ProviderPool {
    sizing: PoolSizing,
    factory: ProviderFactory,
    idle: Mutex<Vec<ProviderSet>>,
    /// Sets currently alive, idle or borrowed.
    total: AtomicUsize,
    stop: Notify,
}

impl ProviderPool {
    /// Build the pool and pre-fill it to `pool_min_size`.
    pub fn new(sizing: PoolSizing, factory: ProviderFactory) -> anyhow::Result<Arc<Self>> {
        let pool = Arc::new(Self {
            sizing,
            factory,
            idle: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            stop: Notify::new(),
        });

        {
            let mut idle = pool.idle.try_lock().expect("fresh pool lock");
            for _ in 0..pool.sizing.pool_min_size {
                match (pool.factory)() {
                    Ok(set) => {
                        idle.push(set);
                        pool.total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("Provider pre-fill failed: {}", e),
                }
            }
            info!("Provider pool primed with {} sets", idle.len());
        }

        Ok(pool)
    }

    /// Start the periodic refill task.
    pub fn start_maintenance(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.sizing.pool_check_interval.max(1));
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.stop.notified() => return,
                    _ = tokio::time::sleep(interval) => pool.refill().await,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn refill(&self) {
        let mut idle = self.idle.lock().await;
        let target = self.sizing.pool_min_size.max(self.sizing.pool_refill_size);
        while idle.len() < target && self.total.load(Ordering::Relaxed) < self.sizing.pool_max_size
        {
            match (self.factory)() {
                Ok(set) => {
                    idle.push(set);
                    self.total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Provider refill failed: {}", e);
                    break;
                }
            }
        }
        debug!(
            "Pool maintenance: idle={}, total={}",
            idle.len(),
            self.total.load(Ordering::Relaxed)
        );
    }

    /// Borrow a provider set for one session. The set's conversation scope
    /// is stamped with the session id before it is handed out.
    pub async fn acquire(&self, session_id: &str) -> anyhow::Result<ProviderSet> {
        let set = {
            let mut idle = self.idle.lock().await;
            idle.pop()
        };

        let set = match set {
            Some(set) => set,
            None => {
                if self.total.load(Ordering::Relaxed) >= self.sizing.pool_max_size {
                    return Err(ProviderError::Unavailable(format!(
                        "pool exhausted ({} sets in use)",
                        self.sizing.pool_max_size
                    ))
                    .into());
                }
                let set = (self.factory)()?;
                self.total.fetch_add(1, Ordering::Relaxed);
                set
            }
        };

        set.llm.set_identity_flag("session", session_id);
        Ok(set)
    }

    /// Return a borrowed set after the session closed.
    pub async fn release(&self, set: ProviderSet) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.sizing.pool_max_size {
            idle.push(set);
        } else {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::energy_vad::EnergyVad;
    use crate::providers::openai::OpenAiLlmProvider;
    use crate::providers::{
        AsrEventListener, AsrProvider, ProviderSet, TtsProvider,
    };
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct NullAsr;

    #[async_trait]
    impl AsrProvider for NullAsr {
        fn set_listener(&self, _listener: Arc<dyn AsrEventListener>) {}
        async fn add_audio(&self, _pcm: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_last_audio(&self, _pcm: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn silence_count(&self) -> u32 {
            0
        }
        fn reset_silence_count(&self) {}
        async fn reset(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close_connection(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NullTts;

    #[async_trait]
    impl TtsProvider for NullTts {
        async fn synthesize(&self, _text: &str) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from("/dev/null"))
        }
        fn provider_type(&self) -> String {
            "null".into()
        }
        fn voice(&self) -> String {
            "null".into()
        }
        fn set_voice(&self, _voice: &str) {}
    }

    fn test_factory() -> ProviderFactory {
        Arc::new(|| {
            Ok(ProviderSet {
                asr: Arc::new(NullAsr),
                llm: Arc::new(OpenAiLlmProvider::new(&Default::default())),
                tts: Arc::new(NullTts),
                vad: Some(Arc::new(EnergyVad::new(2))),
                vlm: None,
            })
        })
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let sizing = PoolSizing {
            pool_min_size: 1,
            pool_max_size: 2,
            pool_refill_size: 0,
            pool_check_interval: 30,
        };
        let pool = ProviderPool::new(sizing, test_factory()).unwrap();
        assert_eq!(pool.total(), 1);

        let a = pool.acquire("s1").await.unwrap();
        let b = pool.acquire("s2").await.unwrap();
        assert_eq!(pool.total(), 2);

        // Third borrow exceeds max.
        assert!(pool.acquire("s3").await.is_err());

        pool.release(a).await;
        let c = pool.acquire("s3").await.unwrap();
        pool.release(b).await;
        pool.release(c).await;
    }
}
