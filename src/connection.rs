//! Serialised access to one instrument link.
//!
//! Hardware state is not safe for interleaved access, and both the main
//! control flow and the watchdog talk to the same instrument. [`Connection`]
//! puts the [`Transport`] behind a single async mutex, so every `write`, `read`
//! and `query` is totally ordered. A `query` holds the lock across its write and
//! its read; a watchdog poll can never land between the two and desynchronise
//! the instrument's output buffer.
//!
//! Compound sequences that must not be split take the lock once with
//! [`Connection::lock`] and use the returned [`LinkGuard`].

use crate::error::{AppResult, BenchError};
use crate::transport::Transport;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct Connection {
    name: String,
    address: String,
    link: Mutex<Option<Box<dyn Transport>>>,
}

impl Connection {
    /// A closed connection for the instrument `name` at `address`.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            link: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Install an open transport, replacing nothing.
    pub async fn attach(&self, transport: Box<dyn Transport>) -> AppResult<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Err(BenchError::Transport {
                resource: self.address.clone(),
                message: format!("{} already has an open link", self.name),
            });
        }
        *link = Some(transport);
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Take the link for a sequence of operations that must not be interleaved.
    pub async fn lock(&self) -> AppResult<LinkGuard<'_>> {
        let guard = self.link.lock().await;
        if guard.is_none() {
            return Err(BenchError::NotConnected {
                name: self.name.clone(),
            });
        }
        Ok(LinkGuard { name: &self.name, guard })
    }

    pub async fn write(&self, command: &str) -> AppResult<()> {
        self.lock().await?.write(command).await
    }

    pub async fn read(&self) -> AppResult<String> {
        self.lock().await?.read().await
    }

    /// Write then read under one lock acquisition.
    pub async fn query(&self, command: &str) -> AppResult<String> {
        self.lock().await?.query(command).await
    }

    /// Query with the transport timeout raised for this one exchange.
    pub async fn query_with_timeout(&self, command: &str, timeout: Duration) -> AppResult<String> {
        let mut link = self.lock().await?;
        let previous = link.transport()?.timeout();
        link.transport()?.set_timeout(timeout);
        let result = link.query(command).await;
        link.transport()?.set_timeout(previous);
        result
    }

    /// Close and drop the transport. Returns `false` if nothing was open.
    pub async fn close(&self) -> AppResult<bool> {
        let transport = self.link.lock().await.take();
        match transport {
            Some(mut transport) => {
                transport.close().await?;
                debug!(instrument = %self.name, address = %self.address, "Link closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Exclusive access to an open link.
pub struct LinkGuard<'a> {
    name: &'a str,
    guard: MutexGuard<'a, Option<Box<dyn Transport>>>,
}

impl LinkGuard<'_> {
    fn transport(&mut self) -> AppResult<&mut Box<dyn Transport>> {
        self.guard.as_mut().ok_or_else(|| BenchError::NotConnected {
            name: self.name.to_string(),
        })
    }

    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        self.transport()?.write(command).await?;
        debug!(instrument = %self.name, "SENT: {}", command);
        Ok(())
    }

    pub async fn read(&mut self) -> AppResult<String> {
        let response = self.transport()?.read().await?;
        let response = response.trim_end().to_string();
        debug!(instrument = %self.name, "RCVD: {}", response);
        Ok(response)
    }

    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command).await?;
        self.read().await
    }
}
