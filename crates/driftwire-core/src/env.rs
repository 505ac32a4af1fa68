//! Environment abstraction for deterministic testing.
//!
//! Decouples runtime logic from system resources (time, randomness).
//! Production code uses [`SystemEnv`]; tests use
//! [`test_utils::MockEnv`] with a manually advanced clock and a
//! deterministic id sequence.

use std::ops::{Add, Sub};
use std::time::Duration;

/// Alphabet for generated ids. Ambiguous glyphs (`0/O`, `1/l/I`) are
/// excluded so ids survive being read aloud or retyped.
const ID_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghikmnopqrstuvwxyz";

/// Length of generated document/method/subscription ids.
const ID_LEN: usize = 17;

/// Abstract environment providing time and randomness.
///
/// # Invariants
///
/// - `now()` never goes backwards within one execution context.
/// - `random_bytes()` uses cryptographically secure entropy in
///   production implementations.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; test
    /// environments may use a virtual clock built on the same type.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + Add<Duration, Output = Self::Instant>
        + Sub<Self::Instant, Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleep for the given duration.
    ///
    /// The only async method in the trait; used by driver code, never
    /// by protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill the buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generate a 17-character id from the unmistakable alphabet.
    ///
    /// Used for document ids, method ids, and subscription wire ids.
    fn random_id(&self) -> String {
        let mut bytes = [0u8; ID_LEN];
        self.random_bytes(&mut bytes);
        bytes.iter().map(|b| char::from(ID_CHARS[usize::from(*b) % ID_CHARS.len()])).collect()
    }
}

/// Production environment backed by the system clock and OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore as _;
        rand::thread_rng().fill_bytes(buffer);
    }
}

/// Deterministic environments for tests.
pub mod test_utils {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::Environment;

    /// Test environment with a manually advanced clock and a counter
    /// based byte sequence, so generated ids are predictable.
    #[derive(Debug, Clone)]
    pub struct MockEnv {
        base: std::time::Instant,
        offset: Arc<Mutex<Duration>>,
        counter: Arc<AtomicU64>,
    }

    impl MockEnv {
        /// Create a mock environment at time zero.
        #[must_use]
        pub fn new() -> Self {
            Self {
                base: std::time::Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
                counter: Arc::new(AtomicU64::new(0)),
            }
        }

        /// Advance the virtual clock.
        pub fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        type Instant = std::time::Instant;

        fn now(&self) -> Self::Instant {
            self.base + *self.offset.lock()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for byte in buffer.iter_mut() {
                // Stride by a prime so consecutive ids differ in every
                // position, not just the last.
                *byte = (self.counter.fetch_add(31, Ordering::Relaxed) % 251) as u8;
            }
        }
    }
}
