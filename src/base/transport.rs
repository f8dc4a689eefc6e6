// Byte transport to the base's motor controller

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::info;

use super::DriverError;

/// A byte stream to the base.
///
/// The driver loop owns its transport exclusively, so implementations need
/// no internal locking.
pub trait Transport: Send {
    /// Read whatever has arrived, waiting no longer than the read timeout.
    /// `Ok(0)` means nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Serial port transport (the Kobuki's FTDI USB adapter)
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self, DriverError> {
        info!("Opening serial port {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(timeout)
            .open()?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::thread::sleep;
    use std::time::Duration;

    use super::Transport;

    #[derive(Default)]
    struct State {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        fail: bool,
    }

    /// In-memory transport; clones share the same buffers
    #[derive(Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<State>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_incoming(&self, bytes: &[u8]) {
            self.state.lock().unwrap().incoming.extend(bytes);
        }

        pub fn written(&self) -> Vec<u8> {
            self.state.lock().unwrap().written.clone()
        }

        /// Make every further read and write fail
        pub fn break_link(&self) {
            self.state.lock().unwrap().fail = true;
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            {
                let mut state = self.state.lock().unwrap();
                if state.fail {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
                }
                if !state.incoming.is_empty() {
                    let n = buf.len().min(state.incoming.len());
                    for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }
            // Stand in for the serial read timeout
            sleep(Duration::from_millis(2));
            Ok(0)
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
            }
            state.written.extend_from_slice(data);
            Ok(())
        }
    }
}
