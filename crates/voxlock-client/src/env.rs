//! Production Environment implementation.

use std::time::Duration;

use voxlock_core::Environment;

/// Production environment: system monotonic clock, OS cryptographic RNG,
/// tokio sleep.
///
/// # Panics
///
/// Panics if the OS RNG fails. A voice client without functioning
/// cryptographic randomness cannot operate: nonces, heartbeat tokens, and
/// MLS key material all depend on it.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let Ok(()) = getrandom::fill(buffer) else {
            unreachable!("OS RNG failure is unrecoverable for a voice client");
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_advances() {
        let env = SystemEnv::new();
        let first = env.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(env.now() > first);
    }

    #[test]
    fn random_bytes_fill_buffer() {
        let env = SystemEnv::new();
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        env.random_bytes(&mut first);
        env.random_bytes(&mut second);
        assert_ne!(first, second);
    }
}
