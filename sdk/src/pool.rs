//! Worker thread pool (§4.6, §5): the receiver task only ever reads a
//! datagram off the socket and hands it here. Everything that can block —
//! dispatching into user objects, waiting on a Proxy's own outgoing
//! transaction — runs on one of these threads, never on the receiver.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Sender<Job>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = std::sync::mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..size.max(1))
            .map(|id| {
                let receiver: Arc<Mutex<Receiver<Job>>> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("netmirror-worker-{id}"))
                    .spawn(move || loop {
                        let job = { receiver.lock().unwrap().recv() };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { sender, handles }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(job));
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the sender side makes every worker's `recv` return `Err`
        // once its current job finishes, so `join` below never blocks on new
        // work showing up.
        let (replacement, _) = std::sync::mpsc::channel();
        self.sender = replacement;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
