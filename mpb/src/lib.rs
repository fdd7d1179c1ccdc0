use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Multi-Producer Broadcast to do many to many (N*N) message passing.
///
/// Every message sent through a [`sender`] handle is delivered to every
/// receiver handed out by [`receiver`]. Receivers registered after a
/// message was sent only see messages sent after their registration.
///
/// [`sender`]: MPB::sender
/// [`receiver`]: MPB::receiver
pub struct MPB<X>
where
    X: Clone + Send + 'static,
{
    sender: Mutex<Option<Sender<X>>>,
    taps: Arc<Mutex<Vec<Sender<X>>>>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<X> MPB<X>
where
    X: Clone + Send + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<X>();
        let taps = Arc::new(Mutex::new(vec![]));
        let pump = Self::spawn_pump(taps.clone(), rx);

        MPB {
            sender: Mutex::new(Some(tx)),
            taps,
            pump: Mutex::new(Some(pump)),
        }
    }

    // fan every inbound message out to the registered taps, dropping
    // taps whose receiver side is gone
    fn spawn_pump(taps: Arc<Mutex<Vec<Sender<X>>>>, rx: Receiver<X>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                let mut taps = taps.lock().unwrap_or_else(PoisonError::into_inner);
                taps.retain(|tap| tap.send(msg.clone()).is_ok());
            }
        })
    }

    pub fn sender(&self) -> Sender<X> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match &*sender {
            Some(sender) => sender.clone(),
            // after close(), a detached sender keeps send() compiling
            // but nothing is listening anymore
            None => unbounded().0,
        }
    }

    pub fn receiver(&self) -> Receiver<X> {
        let (tx, rx) = unbounded();

        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);

        rx
    }

    /// Stop the broadcast and wait the pump thread out. The pump exits
    /// once every sender clone obtained before the close has been
    /// dropped, so callers must not hold one while closing. Idempotent.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            let _ = pump.join();
        }
    }
}

impl<X> Default for MPB<X>
where
    X: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
