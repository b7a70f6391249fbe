//! Where alerts come from.
//!
//! The listener asks its source for at most one alert per cycle and never
//! waits longer than the configured poll timeout.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod replay;

use async_trait::async_trait;
use std::time::Duration;

use crate::alert::ConsumedAlert;
use crate::error::SourceError;

pub use replay::ReplaySource;

#[async_trait]
pub trait AlertSource: Send {
    /// Waits up to `timeout` for one alert. `Ok(None)` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedAlert>, SourceError>;
}

#[async_trait]
impl<S: AlertSource + ?Sized> AlertSource for Box<S> {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedAlert>, SourceError> {
        (**self).poll(timeout).await
    }
}
