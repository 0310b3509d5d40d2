//! Task cancellation
//!
//! Every task carries a [`CancellationToken`] derived from the pool's root
//! token. The token is the only interruption channel into a running codec:
//! a codec that polls it can stop early, one that does not simply runs to
//! completion and its result is discarded. There is no preemption.
//!
//! ```rust
//! use transcode_pool::{CancellationReason, CancellationToken};
//!
//! let root = CancellationToken::new();
//! let task = root.child();
//!
//! root.cancel_with_reason(CancellationReason::PoolClosed);
//! assert!(task.is_cancelled());
//! assert_eq!(task.reason(), Some(CancellationReason::PoolClosed));
//! ```

use crate::core::codec::CodecError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Reason for cancellation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancellationReason {
    /// Cancelled through [`TaskHandle::cancel`](crate::TaskHandle::cancel)
    Manual,
    /// The task deadline elapsed
    Timeout(Duration),
    /// The pool was closed with [`CloseMode::Immediate`](crate::CloseMode::Immediate)
    PoolClosed,
    /// Custom cancellation reason
    Custom(String),
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancellationReason::Manual => write!(f, "cancelled by caller"),
            CancellationReason::Timeout(d) => write!(f, "timeout after {:?}", d),
            CancellationReason::PoolClosed => write!(f, "pool closed"),
            CancellationReason::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

struct TokenInner {
    cancelled: AtomicBool,
    children: RwLock<Vec<Weak<TokenInner>>>,
    reason: RwLock<Option<CancellationReason>>,
}

impl TokenInner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            children: RwLock::new(Vec::new()),
            reason: RwLock::new(None),
        }
    }
}

/// A thread-safe, clonable cancellation flag
///
/// Cancelling a token cancels every child created from it, and the children
/// inherit the parent's reason. Only the first cancellation records a reason.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancellationToken {
    /// Create a new token (not cancelled)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new()),
        }
    }

    /// Creates a child token linked to this parent
    ///
    /// If the parent is already cancelled the child starts cancelled with
    /// the same reason.
    pub fn child(&self) -> Self {
        let child = CancellationToken {
            inner: Arc::new(TokenInner::new()),
        };

        {
            let mut children = self.inner.children.write();
            // Tasks come and go; drop links to finished ones
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }

        if self.is_cancelled() {
            let reason = self.reason().unwrap_or(CancellationReason::Manual);
            child.cancel_with_reason(reason);
        }

        child
    }

    /// Cancel with reason [`CancellationReason::Manual`]
    pub fn cancel(&self) {
        self.cancel_with_reason(CancellationReason::Manual);
    }

    /// Cancel this token and all of its children
    ///
    /// Returns `false` if the token was already cancelled, in which case the
    /// original reason is kept.
    pub fn cancel_with_reason(&self, reason: CancellationReason) -> bool {
        {
            // Reason before flag: a cancelled token always has a reason
            let mut slot = self.inner.reason.write();
            if self.inner.cancelled.load(Ordering::Acquire) {
                return false;
            }
            *slot = Some(reason.clone());
            self.inner.cancelled.store(true, Ordering::Release);
        }

        let children: Vec<_> = self
            .inner
            .children
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for inner in children {
            CancellationToken { inner }.cancel_with_reason(reason.clone());
        }
        true
    }

    /// Check if this token has been cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation reason (if cancelled)
    pub fn reason(&self) -> Option<CancellationReason> {
        self.inner.reason.read().clone()
    }

    /// Returns a codec error if cancelled, `Ok(())` otherwise
    ///
    /// Lets codecs bail out between encoding passes with `?`.
    ///
    /// ```rust
    /// use transcode_pool::{CancellationToken, CodecError};
    ///
    /// fn encode_rows(token: &CancellationToken) -> Result<(), CodecError> {
    ///     for _row in 0..64 {
    ///         token.check()?;
    ///     }
    ///     Ok(())
    /// }
    /// assert!(encode_rows(&CancellationToken::new()).is_ok());
    /// ```
    pub fn check(&self) -> std::result::Result<(), CodecError> {
        if self.is_cancelled() {
            let reason = self
                .reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Err(CodecError::new(format!("interrupted: {}", reason)))
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancellation_token_cancel() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        assert!(token.cancel_with_reason(CancellationReason::Manual));
        assert!(token.is_cancelled());

        // Idempotent, first reason wins
        assert!(!token.cancel_with_reason(CancellationReason::PoolClosed));
        assert_eq!(token.reason(), Some(CancellationReason::Manual));
    }

    #[test]
    fn test_cancellation_token_clone() {
        let token = CancellationToken::new();
        let clone = token.clone();

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_children_inherit_reason() {
        let root = CancellationToken::new();
        let a = root.child();
        let b = a.child();

        root.cancel_with_reason(CancellationReason::PoolClosed);
        assert_eq!(a.reason(), Some(CancellationReason::PoolClosed));
        assert_eq!(b.reason(), Some(CancellationReason::PoolClosed));
    }

    #[test]
    fn test_child_cancellation_is_independent() {
        let root = CancellationToken::new();
        let a = root.child();
        let b = root.child();

        a.cancel();
        assert!(!root.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent() {
        let root = CancellationToken::new();
        root.cancel_with_reason(CancellationReason::Timeout(Duration::from_millis(5)));

        let child = root.child();
        assert!(child.is_cancelled());
        assert_eq!(
            child.reason(),
            Some(CancellationReason::Timeout(Duration::from_millis(5)))
        );
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let root = CancellationToken::new();
        for _ in 0..100 {
            let _ = root.child();
        }
        let _live = root.child();
        assert_eq!(root.inner.children.read().len(), 1);
    }

    #[test]
    fn test_check() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        token.cancel_with_reason(CancellationReason::Custom("shutting down".into()));
        let err = token.check().unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }

    #[test]
    fn test_cross_thread_cancellation() {
        let token = CancellationToken::new();
        let observer = token.clone();

        let handle = thread::spawn(move || {
            for _ in 0..200 {
                if observer.is_cancelled() {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_reason_visible_once_cancelled() {
        for _ in 0..200 {
            let token = CancellationToken::new();
            let observer = token.clone();
            let watcher = thread::spawn(move || {
                while !observer.is_cancelled() {
                    std::hint::spin_loop();
                }
                observer.reason()
            });
            token.cancel_with_reason(CancellationReason::PoolClosed);
            assert_eq!(watcher.join().unwrap(), Some(CancellationReason::PoolClosed));
        }
    }

    #[test]
    fn test_racing_cancellations_keep_one_reason() {
        let token = CancellationToken::new();
        let winners: usize = (0..8)
            .map(|i| {
                let token = token.clone();
                thread::spawn(move || {
                    token.cancel_with_reason(CancellationReason::Custom(format!("r{}", i)))
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert!(matches!(token.reason(), Some(CancellationReason::Custom(_))));
    }
}
