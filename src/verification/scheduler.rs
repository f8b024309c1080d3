//! periodic attempts on every pending verification

use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::verification::engine::VerificationEngine;
use crate::verification::Result;

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

/// Runs `attempt_verification` for each pending row once per interval on its
/// own thread, through the same compare-and-swap path as on-demand attempts
pub struct VerificationScheduler {
    engine: Arc<VerificationEngine>,
    interval: Duration,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl VerificationScheduler {
    pub fn new(engine: Arc<VerificationEngine>, interval: Duration) -> VerificationScheduler {
        VerificationScheduler {
            engine,
            interval,
            signal: Arc::new(StopSignal::default()),
            handle: None,
        }
    }

    /// Attempt every pending verification once, returning how many were tried
    pub fn tick(engine: &VerificationEngine) -> Result<usize> {
        let pending = engine.pending_verifications()?;

        for verification in &pending {
            match engine.attempt_verification(verification.id) {
                Ok(outcome) => log::debug!(
                    "Scheduled attempt on {} for {}: {}",
                    outcome.verification_id,
                    outcome.domain,
                    outcome.status
                ),
                Err(err) => log::warn!(
                    "Scheduled attempt on {} failed: {}",
                    verification.id,
                    err
                ),
            }
        }

        Ok(pending.len())
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        *self.signal.stopped.lock() = false;

        let engine = self.engine.clone();
        let signal = self.signal.clone();
        let interval = self.interval;

        let handle = Builder::new()
            .name("VerificationScheduler".into())
            .spawn(move || {
                log::info!("Verification scheduler polling every {:?}", interval);
                loop {
                    {
                        let mut stopped = signal.stopped.lock();
                        if !*stopped {
                            signal.cvar.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }

                    if let Err(err) = VerificationScheduler::tick(&engine) {
                        log::warn!("Failed to list pending verifications: {}", err);
                    }
                }
                log::info!("Verification scheduler stopped");
            })?;

        self.handle = Some(handle);

        Ok(())
    }

    /// Signal the thread and wait for the current tick to finish
    pub fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.cvar.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for VerificationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::time::Instant;

    use crate::dns::resolver::StaticTxtResolver;
    use crate::store::model::{ServiceType, VerificationStatus};
    use crate::store::{MemoryStore, VerificationStore};
    use crate::verification::engine::EngineSettings;
    use crate::verification::notify::LogNotifier;

    fn engine() -> (Arc<MemoryStore>, Arc<StaticTxtResolver>, Arc<VerificationEngine>) {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(StaticTxtResolver::new());
        let engine = Arc::new(VerificationEngine::new(
            store.clone(),
            store.clone(),
            resolver.clone(),
            Arc::new(LogNotifier),
            EngineSettings::default(),
        ));
        (store, resolver, engine)
    }

    #[test]
    fn test_tick_attempts_pending_rows() {
        let (store, _, engine) = engine();
        let challenge = engine
            .generate_challenge("example.com", ServiceType::Pds, None)
            .unwrap();

        assert_eq!(1, VerificationScheduler::tick(&engine).unwrap());

        let v = store.get_verification(challenge.verification_id).unwrap().unwrap();
        assert_eq!(1, v.attempts);
    }

    #[test]
    fn test_scheduler_verifies_in_background() {
        let (store, resolver, engine) = engine();
        let challenge = engine
            .generate_challenge("example.com", ServiceType::Other, None)
            .unwrap();
        resolver.set(
            "_pds-verify.example.com",
            vec![challenge.txt_record_value.clone()],
        );

        let mut scheduler = VerificationScheduler::new(engine, Duration::from_millis(20));
        scheduler.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut status = VerificationStatus::Pending;
        while Instant::now() < deadline {
            status = store
                .get_verification(challenge.verification_id)
                .unwrap()
                .unwrap()
                .status;
            if status != VerificationStatus::Pending {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(VerificationStatus::Verified, status);
    }

    #[test]
    fn test_stop_is_prompt() {
        let (_, _, engine) = engine();
        let mut scheduler = VerificationScheduler::new(engine, Duration::from_secs(3600));
        scheduler.start().unwrap();

        let started = Instant::now();
        scheduler.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
