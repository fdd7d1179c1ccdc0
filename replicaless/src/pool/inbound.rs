//! Inbound terminal multiplexing.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error};

/// How long a worker may sit in a single read before giving up on the
/// connection.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The engine-supplied handler for one inbound exchange. Returns
/// whether the connection is still good and should be watched for the
/// next request.
pub type Demux = Arc<dyn Fn(&mut TcpStream) -> bool + Send + Sync>;

enum Readiness {
    Ready,
    Idle,
    Gone,
}

/// Accepts inbound connections, watches idle ones for readable data,
/// and hands each active connection to a worker running the demux.
///
/// A connection is owned by exactly one place at a time: the idle set,
/// the worker it was dispatched to, or the channel of worker returns.
pub struct TerminalPool {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    multiplexer: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Inner {
    closing: AtomicBool,
    busy: AtomicUsize,
}

impl TerminalPool {
    /// Bind `addr` and start the multiplexer, dispatching to at most
    /// `max_concurrent` workers. Idle connections are watched every
    /// `select_interval` and dropped after `idle` without traffic.
    pub fn bind(
        addr: SocketAddr,
        max_concurrent: usize,
        select_interval: Duration,
        idle: Duration,
        demux: Demux,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(max_concurrent)
            .thread_name(|_| "terminal worker".to_string())
            .build()
            .map_err(|err| io::Error::new(ErrorKind::Other, err.to_string()))?;

        let inner = Arc::new(Inner {
            closing: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
        });
        let multiplexer = {
            let inner = inner.clone();
            thread::spawn(move || {
                multiplex(
                    &inner,
                    listener,
                    workers,
                    demux,
                    max_concurrent,
                    select_interval,
                    idle,
                )
            })
        };

        Ok(TerminalPool {
            inner,
            local_addr,
            multiplexer: Mutex::new(Some(multiplexer)),
        })
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Idempotent. Lets busy workers finish, closes every connection
    /// still open, stops the multiplexer, then returns.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let multiplexer = self
            .multiplexer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(multiplexer) = multiplexer {
            let _ = multiplexer.join();
        }
    }
}

impl Drop for TerminalPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn multiplex(
    inner: &Arc<Inner>,
    listener: TcpListener,
    workers: rayon::ThreadPool,
    demux: Demux,
    max_concurrent: usize,
    select_interval: Duration,
    idle: Duration,
) {
    let mut free: Vec<(TcpStream, Instant)> = Vec::new();
    let (recent_tx, recent_rx): (Sender<TcpStream>, Receiver<TcpStream>) = unbounded();

    while !inner.closing.load(Ordering::SeqCst) {
        let now = Instant::now();

        // expire connections that sat idle for too long
        free.retain(|(_, since)| now.duration_since(*since) < idle);

        // reclaim connections returned by workers, newest stamps last
        while let Ok(stream) = recent_rx.try_recv() {
            if stream.set_nonblocking(true).is_ok() {
                free.push((stream, now));
            }
        }

        // let new peers in while capacity remains
        while inner.busy.load(Ordering::SeqCst) + free.len() < max_concurrent {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted {}", peer);
                    dispatch(inner, &workers, &demux, &recent_tx, stream);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    // transient accept failures leave the listener up
                    error!("accept failed: {}", err);
                    break;
                }
            }
        }

        // dispatch idle connections with data waiting
        let mut index = 0;
        while index < free.len() {
            match readiness(&free[index].0) {
                Readiness::Ready => {
                    let (stream, _) = free.swap_remove(index);
                    dispatch(inner, &workers, &demux, &recent_tx, stream);
                }
                Readiness::Gone => {
                    free.swap_remove(index);
                }
                Readiness::Idle => index += 1,
            }
        }

        thread::sleep(select_interval);
    }

    // teardown: wait out the busy workers, then close whatever is left
    while inner.busy.load(Ordering::SeqCst) > 0 {
        thread::sleep(Duration::from_millis(5));
    }
    while let Ok(stream) = recent_rx.try_recv() {
        drop(stream);
    }
    free.clear();
}

fn dispatch(
    inner: &Arc<Inner>,
    workers: &rayon::ThreadPool,
    demux: &Demux,
    recent_tx: &Sender<TcpStream>,
    stream: TcpStream,
) {
    let inner = inner.clone();
    let demux = demux.clone();
    let recent_tx = recent_tx.clone();
    inner.busy.fetch_add(1, Ordering::SeqCst);
    workers.spawn(move || {
        let mut stream = stream;
        let keep = prepare(&mut stream).is_ok() && (*demux)(&mut stream);
        if keep && !inner.closing.load(Ordering::SeqCst) {
            let _ = recent_tx.send(stream);
        }
        inner.busy.fetch_sub(1, Ordering::SeqCst);
    });
}

// workers read whole frames, so the socket goes back to blocking mode
// under a timeout for the duration of the exchange
fn prepare(stream: &mut TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(READ_TIMEOUT))
}

fn readiness(stream: &TcpStream) -> Readiness {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe) {
        // an orderly shutdown from the peer
        Ok(0) => Readiness::Gone,
        Ok(_) => Readiness::Ready,
        Err(err) if err.kind() == ErrorKind::WouldBlock => Readiness::Idle,
        Err(_) => Readiness::Gone,
    }
}
