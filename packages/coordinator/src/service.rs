//! Long-running service host with cooperative shutdown.
//!
//! Each worker process runs a small set of services (the runtime loop
//! and the heartbeat reporter) under one cancellation token. Shutdown
//! is cooperative only: services observe the token at their own loop
//! boundaries.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running component owned by the host.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until completion or until `shutdown` is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Runs services concurrently and fans a shutdown signal out to all of
/// them.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Service + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Run all services until ctrl-c, then cancel and wait for them.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let token = CancellationToken::new();

        let signal_token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                signal_token.cancel();
            }
        });

        self.run_with_token(token).await
    }

    /// Run all services under an externally owned token (used by tests
    /// and embedding processes).
    pub async fn run_with_token(self, token: CancellationToken) -> Result<()> {
        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let shutdown = token.clone();
            handles.push((
                name,
                tokio::spawn(async move { service.run(shutdown).await }),
            ));
        }

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => info!(service = name, "service finished"),
                Ok(Err(e)) => error!(service = name, error = %e, "service failed"),
                Err(e) => error!(service = name, error = %e, "service panicked"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagService {
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for FlagService {
        fn name(&self) -> &'static str {
            "flag"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_stops_services() {
        let started = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let host = ServiceHost::new().with_service(FlagService {
            started: started.clone(),
            stopped: stopped.clone(),
        });

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        host.run_with_token(token).await.unwrap();
        assert!(started.load(Ordering::SeqCst));
        assert!(stopped.load(Ordering::SeqCst));
    }
}
