use std::process;
use std::time::Duration;

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("echoprobe: {}", message);
    process::exit(code);
}

/// Validate probe loop parameters
pub fn validate_probe_params(
    count: Option<u32>,
    timeout: Option<u32>,
    interval: Option<u32>,
    ttl: Option<u32>,
) -> anyhow::Result<()> {
    if let Some(count) = count {
        if count == 0 {
            return Err(anyhow::anyhow!("Count must be greater than 0"));
        }
    }

    if let Some(timeout) = timeout {
        if timeout == 0 {
            return Err(anyhow::anyhow!("Timeout must be greater than 0"));
        }
    }

    if let Some(interval) = interval {
        if interval == 0 {
            return Err(anyhow::anyhow!("Interval must be greater than 0"));
        }
    }

    if let Some(ttl) = ttl {
        if ttl == 0 || ttl > 255 {
            return Err(anyhow::anyhow!("TTL must be in the range 1-255"));
        }
    }

    Ok(())
}

/// Format a round-trip time for display
pub fn format_time(ms: f64) -> String {
    if ms < 1.0 {
        format!("{:.3}ms", ms)
    } else {
        format!("{:.2}ms", ms)
    }
}

/// Ctrl+C notification that stays safe to poll after it has completed.
pub struct ShutdownSignal {
    rx: tokio::sync::oneshot::Receiver<()>,
    completed: bool,
    requested: bool,
}

impl ShutdownSignal {
    pub fn new(rx: tokio::sync::oneshot::Receiver<()>) -> Self {
        Self {
            rx,
            completed: false,
            requested: false,
        }
    }

    /// Non-blocking check
    pub fn is_requested(&mut self) -> bool {
        if !self.completed {
            match self.rx.try_recv() {
                Ok(()) => self.finish(true),
                Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {}
                Err(tokio::sync::oneshot::error::TryRecvError::Closed) => self.finish(false),
            }
        }
        self.requested
    }

    /// Sleeps for `duration`, returning early with `true` on Ctrl+C.
    /// A handler that went away without firing never cuts the sleep short.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;

        if !self.completed {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                result = &mut self.rx => self.finish(result.is_ok()),
            }
        }

        if !self.requested {
            tokio::time::sleep_until(deadline).await;
        }
        self.requested
    }

    fn finish(&mut self, requested: bool) {
        self.completed = true;
        self.requested = requested;
    }
}

/// Handle Ctrl+C signal for graceful shutdown
pub fn setup_signal_handler() -> ShutdownSignal {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => log::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    ShutdownSignal::new(rx)
}
