//! Serial transport binding.
//!
//! Owns the physical serial connection and the line framing the engine
//! itself stays agnostic of. One reader thread accumulates raw bytes,
//! extracts `\n`-terminated lines (carriage returns stripped, empty lines
//! dropped) and feeds them to the exchange's receive dispatcher. An I/O
//! failure, or closing the link, fires the link-loss signal exactly once.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::exchange::{MessageExchange, Transport};

/// Poll interval of the reader thread; also bounds close() latency.
const READ_POLL: Duration = Duration::from_millis(100);

/// Serial link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    115200
}

impl SerialConfig {
    /// Config for the given port with the default baud rate.
    pub fn new(port: impl Into<String>) -> Self {
        SerialConfig {
            port: port.into(),
            baud: default_baud(),
        }
    }
}

/// Extract complete lines from the accumulation buffer.
///
/// A line ends at `\n`; `\r` bytes are stripped and empty lines skipped.
/// Bytes after the last terminator stay buffered for the next read.
fn split_lines(buffer: &mut BytesMut) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw = buffer.split_to(pos + 1);
        let text: String = String::from_utf8_lossy(&raw[..pos])
            .chars()
            .filter(|&c| c != '\r')
            .collect();
        if !text.is_empty() {
            lines.push(text);
        }
    }
    lines
}

/// What one raw read from the port means for the link.
#[derive(Debug)]
enum ReadEvent {
    /// Bytes landed in the chunk buffer.
    Data(usize),
    /// Poll interval elapsed with nothing to read.
    Idle,
    /// End of stream: a detached USB adapter stays readable but yields
    /// zero-byte reads, so this counts as link loss, not as idle.
    Closed,
    /// The port failed.
    Failed(std::io::Error),
}

fn classify_read(result: std::io::Result<usize>) -> ReadEvent {
    match result {
        Ok(0) => ReadEvent::Closed,
        Ok(n) => ReadEvent::Data(n),
        Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
            ReadEvent::Idle
        }
        Err(e) => ReadEvent::Failed(e),
    }
}

/// Fire the link-loss signal, at most once per link.
fn fire_link_lost(exchange: &MessageExchange, loss_fired: &AtomicBool, cause: Option<String>) {
    if !loss_fired.swap(true, Ordering::SeqCst) {
        if let Err(e) = exchange.notify_link_lost(cause) {
            warn!(error = %e, "link-loss observer failed");
        }
    }
}

/// A serial connection bound to a [`MessageExchange`].
pub struct SerialLink {
    writer: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    exchange: MessageExchange,
    stop: Arc<AtomicBool>,
    loss_fired: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open the port and start the reader thread.
    pub fn open(config: &SerialConfig, exchange: MessageExchange) -> Result<Self, TransportError> {
        let port = serialport::new(&config.port, config.baud)
            .timeout(READ_POLL)
            .open()?;
        let reader_port = port.try_clone()?;
        debug!(port = %config.port, baud = config.baud, "serial link open");

        let stop = Arc::new(AtomicBool::new(false));
        let loss_fired = Arc::new(AtomicBool::new(false));
        let reader = thread::spawn({
            let exchange = exchange.clone();
            let stop = Arc::clone(&stop);
            let loss_fired = Arc::clone(&loss_fired);
            move || read_loop(reader_port, &exchange, &stop, &loss_fired)
        });

        Ok(SerialLink {
            writer: Arc::new(Mutex::new(Some(port))),
            exchange,
            stop,
            loss_fired,
            reader: Some(reader),
        })
    }

    /// The exchange this link feeds.
    pub fn exchange(&self) -> &MessageExchange {
        &self.exchange
    }

    /// Close the link: stop the reader, drop the port and fire the
    /// link-loss signal if the reader did not already.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        *self.writer.lock().unwrap() = None;
        fire_link_lost(&self.exchange, &self.loss_fired, None);
    }
}

impl Transport for SerialLink {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().unwrap();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread body: frame lines until stopped or the port fails.
fn read_loop(
    mut port: Box<dyn SerialPort>,
    exchange: &MessageExchange,
    stop: &AtomicBool,
    loss_fired: &AtomicBool,
) {
    let mut buffer = BytesMut::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match classify_read(port.read(&mut chunk)) {
            ReadEvent::Data(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                for line in split_lines(&mut buffer) {
                    if let Err(e) = exchange.notify_line(&line) {
                        warn!(%line, error = %e, "line observer failed");
                    }
                }
            }
            // Poll timeout: loop around to check the stop flag.
            ReadEvent::Idle => {}
            ReadEvent::Closed => {
                warn!("serial stream ended, link lost");
                fire_link_lost(exchange, loss_fired, Some("end of stream".to_string()));
                return;
            }
            ReadEvent::Failed(e) => {
                warn!(error = %e, "serial read failed, link lost");
                fire_link_lost(exchange, loss_fired, Some(e.to_string()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines_basic() {
        let mut buffer = BytesMut::from(&b"pos_out\r\npos_in\n"[..]);
        assert_eq!(
            split_lines(&mut buffer),
            vec!["pos_out".to_string(), "pos_in".to_string()]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_split_lines_keeps_partial_tail() {
        let mut buffer = BytesMut::from(&b"rot_stopped\nrot_"[..]);
        assert_eq!(split_lines(&mut buffer), vec!["rot_stopped".to_string()]);
        assert_eq!(&buffer[..], b"rot_");

        buffer.extend_from_slice(b"stopped\n");
        assert_eq!(split_lines(&mut buffer), vec!["rot_stopped".to_string()]);
    }

    #[test]
    fn test_split_lines_drops_empty_lines() {
        let mut buffer = BytesMut::from(&b"\r\n\nconnected\n\n"[..]);
        assert_eq!(split_lines(&mut buffer), vec!["connected".to_string()]);
    }

    #[test]
    fn test_zero_byte_read_means_closed_link() {
        // A detached USB adapter keeps the fd readable but reads yield 0.
        assert!(matches!(classify_read(Ok(0)), ReadEvent::Closed));
        assert!(matches!(classify_read(Ok(8)), ReadEvent::Data(8)));
    }

    #[test]
    fn test_poll_timeout_is_idle_and_io_failure_is_fatal() {
        let poll = std::io::Error::new(ErrorKind::TimedOut, "poll tick");
        assert!(matches!(classify_read(Err(poll)), ReadEvent::Idle));

        let gone = std::io::Error::new(ErrorKind::BrokenPipe, "device gone");
        assert!(matches!(classify_read(Err(gone)), ReadEvent::Failed(_)));
    }

    #[test]
    fn test_link_loss_fires_once() {
        use crate::dispatch::Handler;
        use crate::exchange::Disconnect;

        let exchange = MessageExchange::new();
        let count = Arc::new(Mutex::new(0usize));
        let count_ref = Arc::clone(&count);
        let handler: Handler<Disconnect> = Arc::new(move |_bound, _event| {
            *count_ref.lock().unwrap() += 1;
            Ok(())
        });
        exchange.link_lost().subscribe(handler);

        let fired = AtomicBool::new(false);
        fire_link_lost(&exchange, &fired, Some("end of stream".to_string()));
        fire_link_lost(&exchange, &fired, None);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_config_default_baud() {
        let config = SerialConfig::new("/dev/ttyACM0");
        assert_eq!(config.baud, 115200);
    }
}
