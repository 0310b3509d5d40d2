//! Readiness gate
//!
//! Resolves once, when the first execution unit of a pool finishes warming
//! up. Benchmarks and UIs wait on it so that the first measured conversion
//! does not include codec start-up time.

use crate::core::OnceSignal;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A clonable view of a pool's readiness gate
///
/// ```
/// use transcode_pool::prelude::*;
///
/// # fn main() -> Result<()> {
/// let codec = FnCodec::new(|input, options, _token| {
///     Ok(ConvertOutput::new(input.to_vec(), options.format))
/// });
/// let pool = TranscodePool::new(PoolConfig::new(2), codec)?;
///
/// let ready = pool.ready();
/// assert!(!ready.is_ready());
///
/// pool.launch()?;
/// ready.wait();
/// assert!(pool.ready().is_ready());
/// # pool.close(CloseMode::Graceful)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ReadySignal {
    gate: Arc<OnceSignal<()>>,
}

impl ReadySignal {
    pub(crate) fn new(gate: Arc<OnceSignal<()>>) -> Self {
        Self { gate }
    }

    /// Whether a unit has reached idle
    pub fn is_ready(&self) -> bool {
        self.gate.is_set()
    }

    /// Block until a unit has reached idle
    pub fn wait(&self) {
        self.gate.wait()
    }

    /// Block for at most `timeout`; returns whether the pool became ready
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.gate.wait_timeout(timeout).is_some()
    }
}

impl Future for ReadySignal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.gate.poll_get(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resolves_once() {
        let gate = Arc::new(OnceSignal::new());
        let ready = ReadySignal::new(Arc::clone(&gate));
        assert!(!ready.is_ready());
        assert!(!ready.wait_timeout(Duration::from_millis(10)));

        assert!(gate.set(()));
        assert!(!gate.set(()));
        assert!(ready.is_ready());
        assert!(ready.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_async_wait() {
        let gate = Arc::new(OnceSignal::new());
        let ready = ReadySignal::new(Arc::clone(&gate));

        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gate.set(());
        });

        tokio_test::block_on(ready.clone());
        assert!(ready.is_ready());
        setter.join().unwrap();
    }
}
