// src/io/serial/reader.rs
//
// A serial port opened into a reader/writer pair.
// The reader and writer each own a handle to the OS port (the writer uses a
// try_clone'd handle) so writes never wait behind a pending read.

use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::utils::{
    describe_line, to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits,
};
use crate::io::{ByteReader, ByteWriter, DevicePort, LineConfig, PortInfo};

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Lock flags shared between a device and the streams derived from it.
#[derive(Default)]
struct StreamLocks {
    open: AtomicBool,
    reader: AtomicBool,
    writer: AtomicBool,
}

// ============================================================================
// Device
// ============================================================================

/// An enumerated (or explicitly named) system serial port.
pub struct SerialPortDevice {
    info: PortInfo,
    port_timeout: Duration,
    chunk_size: usize,
    locks: Arc<StreamLocks>,
}

impl SerialPortDevice {
    pub fn new(info: PortInfo, port_timeout: Duration, chunk_size: usize) -> Self {
        Self {
            info,
            port_timeout,
            chunk_size: chunk_size.max(1),
            locks: Arc::new(StreamLocks::default()),
        }
    }
}

#[async_trait]
impl DevicePort for SerialPortDevice {
    fn info(&self) -> PortInfo {
        self.info.clone()
    }

    async fn open(
        &self,
        line: &LineConfig,
    ) -> std::io::Result<(Box<dyn ByteReader>, Box<dyn ByteWriter>)> {
        if self.locks.open.load(Ordering::SeqCst)
            || self.locks.reader.load(Ordering::SeqCst)
            || self.locks.writer.load(Ordering::SeqCst)
        {
            return Err(std::io::Error::other(format!(
                "{} is already open",
                self.info.port_name
            )));
        }

        let port_name = self.info.port_name.clone();
        let data_bits = to_serialport_data_bits(line.data_bits);
        let stop_bits = to_serialport_stop_bits(line.stop_bits);
        let parity = to_serialport_parity(&line.parity);
        let baud_rate = line.baud_rate;
        let timeout = self.port_timeout;

        let (read_port, write_port) = tokio::task::spawn_blocking(move || {
            let port = serialport::new(&port_name, baud_rate)
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .parity(parity)
                .timeout(timeout)
                .open()?;
            let write_port = port.try_clone()?;
            Ok::<_, serialport::Error>((port, write_port))
        })
        .await
        .map_err(|e| std::io::Error::other(format!("Serial open task failed: {}", e)))??;

        self.locks.open.store(true, Ordering::SeqCst);
        self.locks.reader.store(true, Ordering::SeqCst);
        self.locks.writer.store(true, Ordering::SeqCst);

        tlog!(
            "[Serial] Opened {} at {}",
            self.info.port_name,
            describe_line(line)
        );

        Ok((
            Box::new(SerialByteReader::new(
                Arc::new(Mutex::new(read_port)),
                self.locks.clone(),
                self.chunk_size,
            )),
            Box::new(SerialByteWriter {
                port: Some(Arc::new(Mutex::new(write_port))),
                locks: self.locks.clone(),
            }),
        ))
    }

    async fn close(&self) -> std::io::Result<()> {
        // The OS handle closes once the reader and writer drop theirs
        self.locks.open.store(false, Ordering::SeqCst);
        self.locks.reader.store(false, Ordering::SeqCst);
        self.locks.writer.store(false, Ordering::SeqCst);
        tlog!("[Serial] Closed {}", self.info.port_name);
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

type BlockingRead = JoinHandle<std::io::Result<Option<Vec<u8>>>>;

/// Each blocking read holds its own clone of the port until it returns, so
/// the OS handle is only closed once no read is in flight.
struct SerialByteReader {
    port: Option<SharedPort>,
    cancelled: Arc<AtomicBool>,
    locks: Arc<StreamLocks>,
    chunk_size: usize,
    /// Read left running when the caller stopped waiting on it
    in_flight: Option<BlockingRead>,
}

impl SerialByteReader {
    fn new(port: SharedPort, locks: Arc<StreamLocks>, chunk_size: usize) -> Self {
        Self {
            port: Some(port),
            cancelled: Arc::new(AtomicBool::new(false)),
            locks,
            chunk_size,
            in_flight: None,
        }
    }
}

/// Block until bytes arrive, the port reports EOF, or the cancel flag is set.
fn read_blocking(
    port: &SharedPort,
    cancelled: &AtomicBool,
    chunk_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; chunk_size];

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let read_result = match port.lock() {
            Ok(mut port_guard) => port_guard.read(&mut buf),
            Err(e) => {
                return Err(std::io::Error::other(format!(
                    "Port mutex poisoned: {}",
                    e
                )))
            }
        };

        match read_result {
            // EOF - port closed/disconnected
            Ok(0) => return Ok(None),
            Ok(n) => return Ok(Some(buf[..n].to_vec())),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeout is expected for serial reads
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl ByteReader for SerialByteReader {
    async fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        // Resume a read whose caller went away rather than racing a second one
        if self.in_flight.is_none() {
            let port = self
                .port
                .clone()
                .ok_or_else(|| std::io::Error::other("reader has been released"))?;
            let cancelled = self.cancelled.clone();
            let chunk_size = self.chunk_size;
            self.in_flight = Some(tokio::task::spawn_blocking(move || {
                read_blocking(&port, &cancelled, chunk_size)
            }));
        }

        let Some(task) = self.in_flight.as_mut() else {
            return Ok(None);
        };
        let result = task.await;
        self.in_flight = None;
        result.map_err(|e| std::io::Error::other(format!("Serial read task failed: {}", e)))?
    }

    /// Stop reading and wait for any in-flight blocking read to let go of
    /// the port. Bounded by the port timeout.
    async fn cancel(&mut self) -> std::io::Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = self.in_flight.take() {
            // Whatever that read returned is discarded
            if let Err(e) = task.await {
                return Err(std::io::Error::other(format!(
                    "Serial read task failed: {}",
                    e
                )));
            }
        }
        Ok(())
    }

    fn release(&mut self) -> std::io::Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.port = None;
        self.locks.reader.store(false, Ordering::SeqCst);
        if self.in_flight.take().is_some() {
            tlog!("[Serial] Reader released with a read still in flight");
        }
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

struct SerialByteWriter {
    port: Option<SharedPort>,
    locks: Arc<StreamLocks>,
}

impl SerialByteWriter {
    fn port(&self) -> std::io::Result<SharedPort> {
        self.port
            .clone()
            .ok_or_else(|| std::io::Error::other("writer has been released"))
    }
}

#[async_trait]
impl ByteWriter for SerialByteWriter {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let port = self.port()?;
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || match port.lock() {
            Ok(mut port_guard) => port_guard
                .write_all(&data)
                .and_then(|_| port_guard.flush()),
            Err(e) => Err(std::io::Error::other(format!(
                "Port mutex poisoned: {}",
                e
            ))),
        })
        .await
        .map_err(|e| std::io::Error::other(format!("Serial write task failed: {}", e)))?
    }

    async fn close(&mut self) -> std::io::Result<()> {
        let port = self.port()?;

        tokio::task::spawn_blocking(move || match port.lock() {
            Ok(mut port_guard) => port_guard.flush(),
            Err(e) => Err(std::io::Error::other(format!(
                "Port mutex poisoned: {}",
                e
            ))),
        })
        .await
        .map_err(|e| std::io::Error::other(format!("Serial flush task failed: {}", e)))?
    }

    fn release(&mut self) -> std::io::Result<()> {
        self.port = None;
        self.locks.writer.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_port_fails_and_stays_unlocked() {
        let device = SerialPortDevice::new(
            PortInfo {
                port_name: "/dev/serial-link-does-not-exist".to_string(),
                ..PortInfo::default()
            },
            Duration::from_millis(10),
            256,
        );

        assert!(device.open(&LineConfig::default()).await.is_err());
        assert!(!device.locks.open.load(Ordering::SeqCst));
        assert!(!device.locks.reader.load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_waits_for_abandoned_read() {
        let (_master, mut slave) = serialport::TTYPort::pair().unwrap();
        slave.set_timeout(Duration::from_millis(50)).unwrap();
        let boxed: Box<dyn SerialPort> = Box::new(slave);
        let port: SharedPort = Arc::new(Mutex::new(boxed));
        let mut reader = SerialByteReader::new(port.clone(), Arc::new(StreamLocks::default()), 64);

        // give up on a read the way the read loop does when stopped
        let abandoned = tokio::time::timeout(Duration::from_millis(20), reader.read()).await;
        assert!(abandoned.is_err());
        assert!(Arc::strong_count(&port) > 2);

        reader.cancel().await.unwrap();
        reader.release().unwrap();
        // only this test still holds the port; the OS handle closes with it
        assert_eq!(Arc::strong_count(&port), 1);
    }

    #[test]
    fn test_chunk_size_is_at_least_one() {
        let device = SerialPortDevice::new(PortInfo::default(), Duration::from_millis(10), 0);
        assert_eq!(device.chunk_size, 1);
    }
}
