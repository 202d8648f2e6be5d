// src/link/read_loop.rs
//
// Background read task, one per open link.
// Pulls bytes from the reader, decodes them and publishes each chunk to the
// receive buffer. Stops on the cooperative flag, an explicit cancel, end of
// data, or a read error. On a read error it hands off to the fault hook,
// which schedules teardown of the link that produced it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::buffer::ReceiveBuffer;
use crate::io::decoder::Utf8StreamDecoder;
use crate::io::ByteReader;

/// Called with the link generation when a read fails.
pub(crate) type FaultHook = Box<dyn FnOnce(u64) + Send>;

/// The reader, locked by the loop only while a read is in flight.
/// Empty once the loop has released it at end of data.
type ReaderSlot = Arc<Mutex<Option<Box<dyn ByteReader>>>>;

/// Why the loop stopped.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ReadLoopExit {
    Cancelled,
    EndOfStream,
    Fault(String),
}

pub(crate) struct ReadLoop {
    reader: ReaderSlot,
    decoder: Utf8StreamDecoder,
    buffer: Arc<ReceiveBuffer>,
    keep_reading: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    generation: u64,
    on_fault: Option<FaultHook>,
}

/// Control side of a running read loop, owned by the link.
pub(crate) struct ReadLoopHandle {
    reader: ReaderSlot,
    keep_reading: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    task: JoinHandle<ReadLoopExit>,
}

impl ReadLoop {
    pub fn new(
        reader: Box<dyn ByteReader>,
        buffer: Arc<ReceiveBuffer>,
        generation: u64,
        on_fault: Option<FaultHook>,
    ) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Some(reader))),
            decoder: Utf8StreamDecoder::new(),
            buffer,
            keep_reading: Arc::new(AtomicBool::new(true)),
            cancel: Arc::new(Notify::new()),
            generation,
            on_fault,
        }
    }

    pub fn spawn(self) -> ReadLoopHandle {
        let reader = self.reader.clone();
        let keep_reading = self.keep_reading.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        ReadLoopHandle {
            reader,
            keep_reading,
            cancel,
            task,
        }
    }

    async fn run(mut self) -> ReadLoopExit {
        let generation = self.generation;

        loop {
            if !self.keep_reading.load(Ordering::SeqCst) {
                return ReadLoopExit::Cancelled;
            }

            let next = {
                let mut slot = self.reader.lock().await;
                let Some(reader) = slot.as_mut() else {
                    return ReadLoopExit::Cancelled;
                };
                tokio::select! {
                    biased;
                    _ = self.cancel.notified() => None,
                    result = reader.read() => Some(result),
                }
            };

            match next {
                None => return ReadLoopExit::Cancelled,
                Some(Ok(Some(bytes))) => {
                    if !self.keep_reading.load(Ordering::SeqCst) {
                        return ReadLoopExit::Cancelled;
                    }
                    let text = self.decoder.decode(&bytes);
                    self.buffer.publish(text);
                }
                Some(Ok(None)) => {
                    if self.decoder.pending_len() > 0 {
                        tlog!(
                            "[ReadLoop:{}] Stream ended inside a UTF-8 sequence ({} byte(s))",
                            generation,
                            self.decoder.pending_len()
                        );
                    }
                    let tail = self.decoder.finish();
                    if self.keep_reading.load(Ordering::SeqCst) {
                        self.buffer.publish(tail);
                    }
                    if let Some(mut reader) = self.reader.lock().await.take() {
                        if let Err(e) = reader.release() {
                            tlog!(
                                "[ReadLoop:{}] Failed to release reader at end of data: {}",
                                generation,
                                e
                            );
                        }
                    }
                    tlog!("[ReadLoop:{}] Stream ended", generation);
                    return ReadLoopExit::EndOfStream;
                }
                Some(Err(e)) => {
                    tlog!("[ReadLoop:{}] Error reading serial data: {}", generation, e);
                    if let Some(on_fault) = self.on_fault.take() {
                        on_fault(generation);
                    }
                    return ReadLoopExit::Fault(e.to_string());
                }
            }
        }
    }
}

impl ReadLoopHandle {
    /// Clear the keep-reading flag and interrupt the in-flight read.
    pub fn stop(&self) {
        self.keep_reading.store(false, Ordering::SeqCst);
        // notify_one keeps a permit if the loop is not waiting right now
        self.cancel.notify_one();
    }

    /// Wait for the task to exit, giving up after `timeout` and aborting it.
    pub async fn join(&mut self, timeout: Duration) -> Result<ReadLoopExit, String> {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(e)) => Err(format!("read task failed: {}", e)),
            Err(_) => {
                self.task.abort();
                Err(format!("read task did not stop within {:?}", timeout))
            }
        }
    }

    /// Take the reader back for cancel and release. `None` if the loop
    /// already released it, or if a wedged task is still inside a read.
    pub fn take_reader(&self) -> Option<Box<dyn ByteReader>> {
        self.reader.try_lock().ok()?.take()
    }
}
