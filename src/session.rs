//! Lifecycle of one physical device attachment
//!
//! The interconnect's monitor thread reports attach and detach events; both
//! mutate connection state under the same mutex every transaction takes, so
//! an in-flight operation observing a disconnect fails on its own error
//! path instead of being torn down.

use crate::error::LinkError;
use crate::notify::Notifier;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Bound on waiting for the device mutex
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_RETRY: Duration = Duration::from_millis(1);

/// General information reported by an attached device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: String,
    pub product_name: String,
    pub serial_number: String,
    pub version: String,
}

/// Connection-state change pushed to subscribers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub connected: bool,
}

pub(crate) struct SessionInner<I> {
    pub(crate) handle: Option<I>,
    pub(crate) info: DeviceInfo,
}

impl<I> std::fmt::Debug for SessionInner<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("attached", &self.handle.is_some())
            .field("info", &self.info)
            .finish()
    }
}

/// Exclusive owner of the low-level handle. Every device transaction goes
/// through [`Session::lock`], which bounds the wait on the mutex.
pub struct Session<I> {
    inner: Mutex<SessionInner<I>>,
    observers: Notifier<ConnectionEvent>,
}

impl<I> Default for Session<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Session<I> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                handle: None,
                info: DeviceInfo::default(),
            }),
            observers: Notifier::default(),
        }
    }

    /// Register a connection-change subscriber
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(f);
    }

    /// Acquire the device mutex, waiting at most `bound`.
    /// A poisoned mutex still guards a usable handle, so poisoning is
    /// cleared rather than propagated.
    pub(crate) fn lock(&self, bound: Duration) -> Result<MutexGuard<'_, SessionInner<I>>, LinkError> {
        let must_end = Instant::now() + bound;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(p)) => return Ok(p.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= must_end {
                        return Err(LinkError::LockTimeout(bound));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
            }
        }
    }

    /// Called by the monitor thread when a device appears. A second attach
    /// while one is live is ignored.
    pub fn attach(&self, handle: I, info: DeviceInfo) -> Result<(), LinkError> {
        {
            let mut inner = self.lock(LOCK_TIMEOUT)?;
            if inner.handle.is_some() {
                debug!("attach ignored, a device is already open");
                return Ok(());
            }
            info!(product = %info.product_name, serial = %info.serial_number, "device connected");
            inner.handle = Some(handle);
            inner.info = info;
        }
        self.observers.notify(&ConnectionEvent { connected: true });
        Ok(())
    }

    /// Called by the monitor thread when the device disappears
    pub fn detach(&self) -> Result<(), LinkError> {
        {
            let mut inner = self.lock(LOCK_TIMEOUT)?;
            if inner.handle.take().is_none() {
                debug!("detach ignored, no device is open");
                return Ok(());
            }
            info!(product = %inner.info.product_name, "device disconnected");
        }
        self.observers.notify(&ConnectionEvent { connected: false });
        Ok(())
    }

    /// Whether a device is currently attached
    pub fn is_connected(&self) -> bool {
        self.lock(LOCK_TIMEOUT)
            .map(|inner| inner.handle.is_some())
            .unwrap_or(false)
    }

    /// Info reported by the attached device, or the default when detached
    pub fn info(&self) -> Result<DeviceInfo, LinkError> {
        Ok(self.lock(LOCK_TIMEOUT)?.info.clone())
    }
}

impl<I> std::fmt::Debug for Session<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interconnect::mock::Mock;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn attach_and_detach_notify_subscribers() {
        let session: Session<Mock> = Session::new();
        let last = Arc::new(AtomicI32::new(-1));
        {
            let last = Arc::clone(&last);
            session.subscribe(move |event| {
                last.store(i32::from(event.connected), Ordering::SeqCst);
            });
        }
        assert!(!session.is_connected());

        let info = DeviceInfo {
            product_name: "reader".into(),
            ..DeviceInfo::default()
        };
        session.attach(Mock::new(), info.clone()).unwrap();
        assert!(session.is_connected());
        assert_eq!(last.load(Ordering::SeqCst), 1);
        assert_eq!(session.info().unwrap(), info);

        session.detach().unwrap();
        assert!(!session.is_connected());
        assert_eq!(last.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn second_attach_is_ignored() {
        let session: Session<Mock> = Session::new();
        session.attach(Mock::new(), DeviceInfo::default()).unwrap();
        let count = Arc::new(AtomicI32::new(0));
        {
            let count = Arc::clone(&count);
            session.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        session.attach(Mock::new(), DeviceInfo::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bounded_lock_times_out_while_held() {
        let session: Session<Mock> = Session::new();
        let _guard = session.lock(LOCK_TIMEOUT).unwrap();
        let err = session.lock(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LinkError::LockTimeout(_)));
    }
}
