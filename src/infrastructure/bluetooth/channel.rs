//! Backend Channel
//!
//! Single fleet-wide gate around every radio operation. Only one connect,
//! disconnect, register read or register write runs at a time across all
//! sessions; the gate is released before any error reaches the caller.

use crate::domain::models::{MacAddress, ScannedDevice};
use crate::infrastructure::bluetooth::backend::{
    NotificationSender, RadioBackend, RadioError, RadioLink,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default upper bound for one radio operation
pub const DEFAULT_RADIO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BackendChannel<B: RadioBackend> {
    backend: Arc<B>,
    gate: Arc<Mutex<()>>,
    timeout: Duration,
}

impl<B: RadioBackend> Clone for BackendChannel<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            gate: Arc::clone(&self.gate),
            timeout: self.timeout,
        }
    }
}

impl<B: RadioBackend> BackendChannel<B> {
    pub fn new(backend: B, timeout: Duration) -> Self {
        Self::from_shared(Arc::new(backend), timeout)
    }

    pub fn from_shared(backend: Arc<B>, timeout: Duration) -> Self {
        Self {
            backend,
            gate: Arc::new(Mutex::new(())),
            timeout,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Run `op` while holding the gate, bounded by the radio timeout
    async fn exclusive<T, F>(&self, operation: &'static str, op: F) -> Result<T, RadioError>
    where
        F: Future<Output = Result<T, RadioError>>,
    {
        let permit = self.gate.lock().await;
        debug!(operation, "radio operation started");
        let result = match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, "radio operation timed out after {:?}", self.timeout);
                Err(RadioError::Timeout {
                    operation,
                    timeout: self.timeout,
                })
            }
        };
        drop(permit);
        result
    }

    pub async fn connect(
        &self,
        mac: MacAddress,
        notifications: NotificationSender,
    ) -> Result<B::Link, RadioError> {
        self.exclusive("connect", self.backend.connect(mac, notifications))
            .await
    }

    pub async fn disconnect(&self, link: &mut B::Link) -> Result<(), RadioError> {
        self.exclusive("disconnect", link.disconnect()).await
    }

    pub async fn read(&self, link: &mut B::Link, handle: u16) -> Result<Vec<u8>, RadioError> {
        self.exclusive("read", link.read_handle(handle)).await
    }

    pub async fn write(
        &self,
        link: &mut B::Link,
        handle: u16,
        data: &[u8],
    ) -> Result<(), RadioError> {
        self.exclusive("write", link.write_handle(handle, data))
            .await
    }

    /// Discovery holds the gate for the whole scan
    pub async fn discover(&self, duration: Duration) -> Result<Vec<ScannedDevice>, RadioError> {
        let _permit = self.gate.lock().await;
        match tokio::time::timeout(duration + self.timeout, self.backend.discover(duration)).await {
            Ok(result) => result,
            Err(_) => Err(RadioError::Timeout {
                operation: "discover",
                timeout: duration + self.timeout,
            }),
        }
    }
}
