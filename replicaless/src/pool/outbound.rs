//! Outbound connection recycling.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Recycles outbound TCP connections per destination and bounds how
/// long an idle one may live.
///
/// A connection is in exactly one place at any time: pooled, in the
/// hands of a [`perform`] caller, or closed.
///
/// [`perform`]: ConnectionPool::perform
pub struct ConnectionPool {
    shared: Arc<Shared>,
    close_tx: Sender<()>,
    culler: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    // per destination, ordered by last use ascending: the culler drains
    // the front, perform takes and returns at the back
    idle: Mutex<HashMap<SocketAddr, VecDeque<(TcpStream, Instant)>>>,
    closing: AtomicBool,
    idle_threshold: Duration,
}

impl ConnectionPool {
    /// A pool whose culler wakes every `interval` and closes
    /// connections idle for `idle_threshold` or longer.
    pub fn new(interval: Duration, idle_threshold: Duration) -> Self {
        let shared = Arc::new(Shared {
            idle: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            idle_threshold,
        });
        let (close_tx, close_rx) = bounded(1);
        let culler = {
            let shared = shared.clone();
            thread::spawn(move || cull_loop(&shared, &close_rx, interval))
        };
        ConnectionPool {
            shared,
            close_tx,
            culler: Mutex::new(Some(culler)),
        }
    }

    /// Acquire (or open) a connection to `addr`, hand it to `f`, and
    /// pool it again iff `f` returns true. Returns `f`'s result, or
    /// false when no connection could be acquired.
    pub fn perform<F>(&self, addr: SocketAddr, f: F) -> bool
    where
        F: FnOnce(&mut TcpStream) -> bool,
    {
        if self.shared.closing.load(Ordering::SeqCst) {
            return false;
        }

        let pooled = {
            let mut idle = self.shared.lock_idle();
            idle.get_mut(&addr).and_then(|queue| queue.pop_back())
        };
        let mut stream = match pooled {
            Some((stream, _)) => stream,
            None => match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => stream,
                Err(err) => {
                    debug!("connect to {} failed: {}", addr, err);
                    return false;
                }
            },
        };

        let keep = f(&mut stream);
        if keep {
            // the closing check shares the idle lock with the culler's
            // final sweep, so nothing slips back in after it
            let mut idle = self.shared.lock_idle();
            if !self.shared.closing.load(Ordering::SeqCst) {
                idle.entry(addr)
                    .or_insert_with(VecDeque::new)
                    .push_back((stream, Instant::now()));
            }
        }
        keep
    }

    /// The number of pooled connections to `addr`.
    pub fn idle_count(&self, addr: SocketAddr) -> usize {
        self.shared
            .lock_idle()
            .get(&addr)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Idempotent. Stops the culler, which closes every pooled
    /// connection on its way out; later [`perform`] calls return false.
    ///
    /// [`perform`]: ConnectionPool::perform
    pub fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.send(());
        let culler = self
            .culler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(culler) = culler {
            let _ = culler.join();
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock_idle(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, VecDeque<(TcpStream, Instant)>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cull_loop(shared: &Shared, close_rx: &Receiver<()>, interval: Duration) {
    loop {
        match close_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => cull_once(shared),
            _ => break,
        }
    }
    // dropping the streams closes them
    shared.lock_idle().clear();
}

fn cull_once(shared: &Shared) {
    let now = Instant::now();
    let mut idle = shared.lock_idle();
    idle.retain(|addr, queue| {
        // ordered by last use, so stop at the first fresh one
        while let Some((_, last_used)) = queue.front() {
            if now.duration_since(*last_used) >= shared.idle_threshold {
                queue.pop_front();
                debug!("culled an idle connection to {}", addr);
            } else {
                break;
            }
        }
        !queue.is_empty()
    });
}
