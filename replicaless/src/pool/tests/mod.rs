use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::pool::{ConnectionPool, TerminalPool};

/// A throwaway echo server that counts the connections it accepted.
struct EchoServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl EchoServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));

        let count = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                count.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    let mut byte = [0u8; 1];
                    while let Ok(1) = stream.read(&mut byte) {
                        if stream.write_all(&byte).is_err() {
                            return;
                        }
                    }
                });
            }
        });

        EchoServer { addr, accepted }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

fn echo_once(stream: &mut TcpStream) -> bool {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
    if stream.write_all(b"p").is_err() {
        return false;
    }
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).is_ok() && byte == *b"p"
}

#[test]
fn a_recycled_connection_is_reused() {
    let server = EchoServer::start();
    let pool = ConnectionPool::new(Duration::from_secs(10), Duration::from_secs(60));

    assert!(pool.perform(server.addr, echo_once));
    assert_eq!(pool.idle_count(server.addr), 1);

    assert!(pool.perform(server.addr, echo_once));
    assert_eq!(pool.idle_count(server.addr), 1);

    // one transport connection served both exchanges
    assert_eq!(server.accepted(), 1);
    pool.close();
}

#[test]
fn a_failed_exchange_closes_the_connection() {
    let server = EchoServer::start();
    let pool = ConnectionPool::new(Duration::from_secs(10), Duration::from_secs(60));

    assert!(!pool.perform(server.addr, |_| false));
    assert_eq!(pool.idle_count(server.addr), 0);

    assert!(pool.perform(server.addr, echo_once));
    assert_eq!(server.accepted(), 2);
    pool.close();
}

#[test]
fn idle_connections_are_reclaimed_without_caller_action() {
    let server = EchoServer::start();
    let pool = ConnectionPool::new(Duration::from_millis(100), Duration::from_millis(400));

    assert!(pool.perform(server.addr, echo_once));
    assert_eq!(pool.idle_count(server.addr), 1);

    thread::sleep(Duration::from_millis(800));
    assert_eq!(pool.idle_count(server.addr), 0);

    // the next exchange opens a fresh connection
    assert!(pool.perform(server.addr, echo_once));
    assert_eq!(server.accepted(), 2);
    pool.close();
}

#[test]
fn a_fresh_connection_is_not_reclaimed() {
    let server = EchoServer::start();
    let pool = ConnectionPool::new(Duration::from_millis(50), Duration::from_secs(60));

    assert!(pool.perform(server.addr, echo_once));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(pool.idle_count(server.addr), 1);
    pool.close();
}

#[test]
fn an_unreachable_destination_reports_failure() {
    // a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let vacant = listener.local_addr().expect("local addr");
    drop(listener);

    let pool = ConnectionPool::new(Duration::from_secs(10), Duration::from_secs(60));
    assert!(!pool.perform(vacant, |_| panic!("never acquired")));
    pool.close();
}

#[test]
fn close_empties_the_pool_and_rejects_later_callers() {
    let server = EchoServer::start();
    let pool = ConnectionPool::new(Duration::from_secs(10), Duration::from_secs(60));

    assert!(pool.perform(server.addr, echo_once));
    assert_eq!(pool.idle_count(server.addr), 1);

    pool.close();
    pool.close();
    assert_eq!(pool.idle_count(server.addr), 0);
    assert!(!pool.perform(server.addr, echo_once));
}

//
// terminal pool
//

fn start_terminal(demux: crate::pool::Demux) -> TerminalPool {
    TerminalPool::bind(
        "127.0.0.1:0".parse().expect("addr"),
        4,
        Duration::from_millis(5),
        Duration::from_secs(60),
        demux,
    )
    .expect("bind terminal pool")
}

#[test]
fn each_readable_connection_reaches_the_demux() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let terminal = start_terminal(Arc::new(move |stream: &mut TcpStream| {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).is_err() {
            return false;
        }
        counter.fetch_add(1, Ordering::SeqCst);
        stream.write_all(&byte).is_ok()
    }));

    let mut client = TcpStream::connect(terminal.local_addr()).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");

    // the same connection goes idle and is re-dispatched per exchange
    for _ in 0..3 {
        client.write_all(b"m").expect("send");
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).expect("echo");
    }
    assert_eq!(served.load(Ordering::SeqCst), 3);
    terminal.close();
}

#[test]
fn a_rejected_exchange_closes_only_that_connection() {
    let terminal = start_terminal(Arc::new(|stream: &mut TcpStream| {
        let mut byte = [0u8; 1];
        let _ = stream.read_exact(&mut byte);
        false
    }));

    let mut doomed = TcpStream::connect(terminal.local_addr()).expect("connect");
    doomed
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    doomed.write_all(b"x").expect("send");

    // the worker closed the socket; the read drains to end of stream
    let mut sink = Vec::new();
    assert_eq!(doomed.read_to_end(&mut sink).unwrap_or(0), 0);

    // the listener is still serving others
    assert!(TcpStream::connect(terminal.local_addr()).is_ok());
    terminal.close();
}

#[test]
fn close_waits_for_busy_workers() {
    let terminal = start_terminal(Arc::new(|stream: &mut TcpStream| {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).is_err() {
            return false;
        }
        thread::sleep(Duration::from_millis(200));
        stream.write_all(&byte).is_ok()
    }));
    let addr = terminal.local_addr();

    let mut client = TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    client.write_all(b"s").expect("send");

    // give the multiplexer a beat to hand the socket to a worker
    thread::sleep(Duration::from_millis(50));
    terminal.close();
    terminal.close();

    // the in-flight exchange still completed
    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).expect("served during close");

    // nothing is listening anymore
    assert!(TcpStream::connect(addr).is_err());
}
