//! Process lifecycle primitives: graceful termination of worker children
//! and loopback port allocation.

use std::ops::RangeInclusive;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::process::Child;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Ask a child to exit, escalating only if it ignores the request.
///
/// Sends SIGTERM, waits up to `grace` for the child to exit on its own,
/// then SIGKILLs. Returns only once the child has actually exited, and is
/// safe to call on a child that already has.
pub async fn kill_gracefully(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM delivery failed, child likely gone");
        }
    }
    #[cfg(not(unix))]
    child.start_kill()?;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = child.id(), grace_ms = grace.as_millis() as u64, "child ignored SIGTERM, killing");
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// True when nothing is currently bound to the port on loopback.
pub async fn port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    #[error("no free port in range {start}..={end}")]
    NoneFree { start: u16, end: u16 },
}

/// Reserved port. The allocator stays locked until this is dropped, so two
/// concurrent spawns can never be handed the same port; drop it once the
/// child has bound.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    _guard: OwnedMutexGuard<()>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Scans a fixed range for a free loopback port, one reservation at a time.
#[derive(Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    lock: Arc<Mutex<()>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        PortAllocator { start: *range.start(), end: *range.end(), lock: Arc::new(Mutex::new(())) }
    }

    pub async fn reserve(&self) -> Result<PortReservation, PortError> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        for port in self.start..=self.end {
            if port_available(port).await {
                debug!(port, "port reserved");
                return Ok(PortReservation { port, _guard: guard });
            }
        }
        Err(PortError::NoneFree { start: self.start, end: self.end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::process::Command;

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep")
    }

    #[tokio::test]
    async fn graceful_kill_is_idempotent() {
        let mut child = sleeper();
        kill_gracefully(&mut child, Duration::from_secs(2)).await.unwrap();
        // Second call must not error or hang.
        kill_gracefully(&mut child, Duration::from_secs(2)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn term_resistant_child_is_killed_after_grace() {
        // A shell that traps SIGTERM and keeps sleeping.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 1; done")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let grace = Duration::from_millis(500);
        let started = Instant::now();
        let status = kill_gracefully(&mut child, grace).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() >= grace, "must wait out the grace period first");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn reserved_port_is_actually_free() {
        let alloc = PortAllocator::new(42300..=42320);
        let reservation = alloc.reserve().await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", reservation.port())).await.unwrap();
        drop(reservation);
        drop(listener);
    }

    #[tokio::test]
    async fn exhausted_range_is_reported() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let alloc = PortAllocator::new(port..=port);
        assert_eq!(
            alloc.reserve().await.unwrap_err(),
            PortError::NoneFree { start: port, end: port }
        );
    }

    #[tokio::test]
    async fn concurrent_reservations_never_collide() {
        let alloc = PortAllocator::new(42340..=42360);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            tasks.push(tokio::spawn(async move {
                let reservation = alloc.reserve().await.unwrap();
                let port = reservation.port();
                // Bind before releasing the reservation, as a spawner would.
                let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
                drop(reservation);
                (port, listener)
            }));
        }
        let mut seen = std::collections::HashSet::new();
        let mut listeners = Vec::new();
        for task in tasks {
            let (port, listener) = task.await.unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
            listeners.push(listener);
        }
    }
}
