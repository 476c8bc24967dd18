//! Ordered log sink running on its own thread.
//!
//! Producers on any thread push records through a cloneable [`Logger`]; a
//! single worker forwards them to the `log` facade in submission order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::Level;

use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

const TARGET: &str = "lifx_lights_rs";

enum LogItem {
    Record {
        level: Level,
        message: String,
        emit: bool,
    },
    Shutdown,
}

/// Cheap handle for submitting log records to a [`LogSink`].
#[derive(Clone)]
pub struct Logger {
    tx: Sender<LogItem>,
    enabled: Arc<AtomicBool>,
}

impl Logger {
    pub fn log(&self, level: Level, message: impl Into<String>) {
        // The sink may already be gone during teardown; dropping the record is fine.
        let _ = self.tx.send(LogItem::Record {
            level,
            message: message.into(),
            emit: self.is_enabled(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    /// Turns emission on or off for records submitted from now on.
    ///
    /// Records submitted while disabled still pass through the queue.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Owns the log worker thread.
pub struct LogSink {
    logger: Logger,
    worker: Option<JoinHandle<()>>,
}

impl LogSink {
    pub fn start(enabled: bool) -> Result<Self> {
        Self::start_with(enabled, |level, message| {
            log::log!(target: TARGET, level, "{message}")
        })
    }

    /// Starts the sink with a custom emitter instead of the `log` facade.
    pub fn start_with<F>(enabled: bool, emit: F) -> Result<Self>
    where
        F: Fn(Level, &str) + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("lifx-logger".into())
            .spawn(move || drain(rx, emit))
            .map_err(|e| Error::socket("spawn logger", e))?;

        Ok(LogSink {
            logger: Logger {
                tx,
                enabled: Arc::new(AtomicBool::new(enabled)),
            },
            worker: Some(worker),
        })
    }

    pub fn logger(&self) -> Logger {
        self.logger.clone()
    }

    /// Queues the shutdown sentinel behind every pending record and joins the worker.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.logger.tx.send(LogItem::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain<F>(rx: Receiver<LogItem>, emit: F)
where
    F: Fn(Level, &str),
{
    while let Ok(item) = rx.recv() {
        match item {
            LogItem::Record {
                level,
                message,
                emit: true,
            } => emit(level, &message),
            LogItem::Record { .. } => {}
            LogItem::Shutdown => break,
        }
    }
}
