//! Task execution and wakeup scheduling seams.
//!
//! Removal notifications, refresh loads, and offloaded maintenance passes
//! are all funneled through an [`Executor`].  The default executor runs
//! every task inline on the calling thread, which keeps the cache free of
//! background threads; callers who want listeners and refreshes off their
//! critical path install their own executor (a thread pool handle works —
//! the trait is one method).
//!
//! A [`Scheduler`] is the optional timer source used to wake the cache when
//! the next entry is due to expire.  Without one, expiration is strictly
//! lazy: expired entries are collected on the next read or maintenance pass
//! that happens to run.

use std::time::Duration;

/// A sink for deferred work.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs every submitted task immediately on the calling thread.
///
/// This is the default.  With it, removal listeners run on whichever thread
/// triggered the maintenance pass, and per-key notification order follows
/// submission order trivially.
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    #[inline]
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// An [`Executor`] backed by a closure, for bridging to thread pools.
///
/// # Example
/// ```
/// use cortado::exec::FnExecutor;
///
/// let pool = FnExecutor(|task: Box<dyn FnOnce() + Send>| {
///     std::thread::spawn(task);
/// });
/// ```
pub struct FnExecutor<F>(pub F);

impl<F> Executor for FnExecutor<F>
where
    F: Fn(Box<dyn FnOnce() + Send>) + Send + Sync + 'static,
{
    #[inline]
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        (self.0)(task)
    }
}

/// A single-shot timer source.
///
/// After each maintenance pass the cache computes the earliest pending
/// expiration deadline and, when a scheduler is configured, asks it to run
/// a wakeup task after that delay.  The task holds only a weak reference to
/// the cache, so an armed timer never keeps a dropped cache alive.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>);
}

/// A [`Scheduler`] backed by a closure.
pub struct FnScheduler<F>(pub F);

impl<F> Scheduler for FnScheduler<F>
where
    F: Fn(Duration, Box<dyn FnOnce() + Send>) + Send + Sync + 'static,
{
    #[inline]
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        (self.0)(delay, task)
    }
}
