//! Capability traits shared by single and multichannel instruments.
//!
//! Code that only needs one aspect of an instrument (a session supervisor
//! that opens and closes things, a sweep that reserves channels) takes the
//! trait rather than the concrete type.

use super::{Instrument, Lifecycle, MultichannelInstrument};
use crate::channel::Channel;
use crate::error::{AppResult, BenchError};
use crate::transport::ResourceManager;
use crate::watchdog::{AbortSignal, Fault};
use async_trait::async_trait;

/// Lifecycle control.
#[async_trait]
pub trait Connectable: Send + Sync {
    fn name(&self) -> &str;
    async fn state(&self) -> Lifecycle;
    async fn open(&self, resources: &dyn ResourceManager) -> AppResult<()>;
    async fn initialize(&self, abort: &AbortSignal) -> AppResult<()>;
    async fn close(&self) -> AppResult<()>;
    async fn test_connection(&self, resources: &dyn ResourceManager) -> bool;
}

/// Reset and error-queue access.
#[async_trait]
pub trait ResettableDevice: Send + Sync {
    async fn reset(&self) -> AppResult<()>;
    async fn errors(&self) -> AppResult<Vec<Fault>>;
}

/// Channel access. Instruments without channels report a count of zero.
#[async_trait]
pub trait ChannelHost: Send + Sync {
    fn channel_count(&self) -> usize;
    fn channel(&self, index: usize) -> AppResult<Channel>;
    async fn reserve_channel(&self, index: usize, purpose: &str) -> AppResult<Channel>;
}

#[async_trait]
impl Connectable for Instrument {
    fn name(&self) -> &str {
        Instrument::name(self)
    }

    async fn state(&self) -> Lifecycle {
        Instrument::state(self).await
    }

    async fn open(&self, resources: &dyn ResourceManager) -> AppResult<()> {
        Instrument::open(self, resources).await
    }

    async fn initialize(&self, abort: &AbortSignal) -> AppResult<()> {
        Instrument::initialize(self, abort).await
    }

    async fn close(&self) -> AppResult<()> {
        Instrument::close(self).await
    }

    async fn test_connection(&self, resources: &dyn ResourceManager) -> bool {
        Instrument::test_connection(self, resources).await
    }
}

#[async_trait]
impl Connectable for MultichannelInstrument {
    fn name(&self) -> &str {
        MultichannelInstrument::name(self)
    }

    async fn state(&self) -> Lifecycle {
        self.base().state().await
    }

    async fn open(&self, resources: &dyn ResourceManager) -> AppResult<()> {
        MultichannelInstrument::open(self, resources).await
    }

    async fn initialize(&self, abort: &AbortSignal) -> AppResult<()> {
        MultichannelInstrument::initialize(self, abort).await
    }

    async fn close(&self) -> AppResult<()> {
        MultichannelInstrument::close(self).await
    }

    async fn test_connection(&self, resources: &dyn ResourceManager) -> bool {
        self.base().test_connection(resources).await
    }
}

#[async_trait]
impl ResettableDevice for Instrument {
    async fn reset(&self) -> AppResult<()> {
        Instrument::reset(self).await
    }

    async fn errors(&self) -> AppResult<Vec<Fault>> {
        Instrument::errors(self).await
    }
}

#[async_trait]
impl ResettableDevice for MultichannelInstrument {
    async fn reset(&self) -> AppResult<()> {
        self.base().reset().await
    }

    async fn errors(&self) -> AppResult<Vec<Fault>> {
        self.base().errors().await
    }
}

#[async_trait]
impl ChannelHost for Instrument {
    fn channel_count(&self) -> usize {
        0
    }

    fn channel(&self, index: usize) -> AppResult<Channel> {
        Err(BenchError::InvalidChannel {
            instrument: Instrument::name(self).to_string(),
            index,
            count: 0,
        })
    }

    async fn reserve_channel(&self, index: usize, _purpose: &str) -> AppResult<Channel> {
        ChannelHost::channel(self, index)
    }
}

#[async_trait]
impl ChannelHost for MultichannelInstrument {
    fn channel_count(&self) -> usize {
        MultichannelInstrument::channel_count(self)
    }

    fn channel(&self, index: usize) -> AppResult<Channel> {
        MultichannelInstrument::channel(self, index).cloned()
    }

    async fn reserve_channel(&self, index: usize, purpose: &str) -> AppResult<Channel> {
        MultichannelInstrument::reserve_channel(self, index, purpose).await
    }
}
