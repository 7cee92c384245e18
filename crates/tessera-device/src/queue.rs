//! Asynchronous in-order device queues
//!
//! A [`Queue`] owns a worker thread that runs launched kernels one after
//! another on its device's execution units. `launch` returns immediately;
//! `sync` waits for everything launched so far and reports the first fault.
//! After a fault, later kernels on the queue are skipped until the fault
//! has been reported.

use crate::device::Device;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::thread::JoinHandle;
use tessera_core::{Error, Result};
use tracing::{debug, trace};

type Kernel = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Command {
    Launch(Kernel),
    Sync(Sender<Option<Error>>),
}

/// In-order stream of kernels on one device
pub struct Queue {
    device: Device,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    pub fn new(device: &Device) -> Result<Self> {
        let (tx, rx) = channel::<Command>();
        let dev = device.clone();
        let worker = std::thread::Builder::new()
            .name(format!("tessera-queue{}", device.id()))
            .spawn(move || {
                let mut fault: Option<Error> = None;
                for command in rx {
                    match command {
                        Command::Launch(kernel) => {
                            if fault.is_some() {
                                continue;
                            }
                            let outcome = catch_unwind(AssertUnwindSafe(|| dev.install(kernel)));
                            match outcome {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => fault = Some(e),
                                Err(_) => {
                                    fault = Some(Error::Device(format!(
                                        "Kernel panicked on device {}",
                                        dev.id()
                                    )))
                                }
                            }
                        }
                        Command::Sync(reply) => {
                            // the waiting side may have given up
                            let _ = reply.send(fault.take());
                        }
                    }
                }
            })
            .map_err(|e| Error::Device(format!("Failed to start queue on device {}: {e}", device.id())))?;
        Ok(Self {
            device: device.clone(),
            commands: Some(tx),
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| Error::Device("queue is shut down".to_string()))?
            .send(command)
            .map_err(|_| Error::Device(format!("Queue worker on device {} has exited", self.device.id())))
    }

    /// Enqueue `kernel`; runs after everything launched before it
    pub fn launch(&self, kernel: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        trace!(device = self.device.id(), "launch");
        self.submit(Command::Launch(Box::new(kernel)))
    }

    /// Wait for all launched kernels; returns the first fault since the last sync
    pub fn sync(&self) -> Result<()> {
        let (tx, rx) = channel();
        self.submit(Command::Sync(tx))?;
        match rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(fault)) => Err(fault),
            Err(_) => Err(Error::Device(format!(
                "Queue worker on device {} exited during sync",
                self.device.id()
            ))),
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                debug!(device = self.device.id(), "queue worker panicked");
            }
        }
    }
}
