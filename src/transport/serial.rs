//! Serial port transport.

use std::io::{self, Read, Write};
use std::time::Duration;

use hexplay::HexViewBuilder;
use log::{debug, info, log_enabled, trace, Level::Trace};
use serialport::{available_ports as enumerate, ClearBuffer, SerialPort, SerialPortType};

use super::{Incoming, Transport};
use crate::error::{ProtocolError, Result};
use crate::settings::Settings;

/// Largest chunk pulled from the port in a single read.
const READ_CHUNK_SIZE: usize = 4096;

// =============================================================================
// Public Interface
// =============================================================================

/// A [`Transport`] over a serial port, configured from [`Settings`].
///
/// The port is only opened by [`Transport::open`]; until then every other
/// operation fails with [`ProtocolError::TransportClosed`].
pub struct SerialTransport {
    settings: Settings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(settings: Settings) -> Self {
        SerialTransport {
            settings,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(ProtocolError::TransportClosed)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, baud_rate: u32) -> Result<()> {
        use retry::{delay, retry_with_index};

        let path = self
            .settings
            .path
            .clone()
            .ok_or_else(|| ProtocolError::Validation("no serial port path configured".into()))?;
        let settings = &self.settings;

        // Freshly plugged USB serial controllers take a moment to show up.
        let result = retry_with_index(
            delay::Fixed::from_millis(1000).take(3),
            |index| -> std::result::Result<Box<dyn SerialPort>, serialport::Error> {
                debug!("Trying to open {} (attempt {})", path, index);
                serialport::new(&path, baud_rate)
                    .data_bits(settings.data_bits)
                    .stop_bits(settings.stop_bits)
                    .parity(settings.parity)
                    .flow_control(settings.flow_control)
                    .timeout(settings.command_timeout)
                    .open()
            },
        );

        let port = match result {
            Ok(port) => port,
            Err(retry::Error::Operation {
                error,
                total_delay,
                tries,
            }) => {
                info!(
                    "Failed to open the port after {:?} and {} tries: {}",
                    total_delay, tries, error,
                );
                return Err(error.into());
            }
            Err(retry::Error::Internal(description)) => {
                return Err(serialport::Error::new(serialport::ErrorKind::Unknown, description).into())
            }
        };

        info!("Connected to {} at {} baud", path, baud_rate);
        debug!("data_bits    : {:?}", settings.data_bits);
        debug!("stop_bits    : {:?}", settings.stop_bits);
        debug!("parity       : {:?}", settings.parity);
        debug!("flow control : {:?}", settings.flow_control);

        self.port = Some(port);
        Ok(())
    }

    fn read_chunk(&mut self, timeout: Duration) -> Result<Incoming> {
        let port = self.port()?;
        // A zero timeout would turn the read into a busy poll.
        port.set_timeout(timeout.max(Duration::from_millis(1)))?;

        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        match port.read(&mut buffer) {
            Ok(0) => Ok(Incoming::Idle),
            Ok(count) => {
                buffer.truncate(count);
                if log_enabled!(Trace) {
                    let view = HexViewBuilder::new(&buffer)
                        .address_offset(0)
                        .row_width(16)
                        .finish();
                    trace!("<= {} bytes\n{}", count, view);
                }
                Ok(Incoming::Bytes(buffer))
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(Incoming::Idle),
            Err(ref e) if is_disconnect(e) => {
                debug!("serial port went away: {}", e);
                Ok(Incoming::EndOfStream)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;
        if log_enabled!(Trace) {
            let view = HexViewBuilder::new(data)
                .address_offset(0)
                .row_width(16)
                .finish();
            trace!("=> {} bytes\n{}", data.len(), view);
        }
        match port.write_all(data).and_then(|_| port.flush()) {
            Ok(()) => Ok(()),
            Err(ref e) if is_disconnect(e) => Err(ProtocolError::TransportClosed),
            Err(e) => Err(e.into()),
        }
    }

    fn set_baud(&mut self, baud_rate: u32) -> Result<()> {
        let port = self.port()?;
        port.set_baud_rate(baud_rate)?;
        info!("Serial port switched to {} baud", baud_rate);
        Ok(())
    }

    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<()> {
        let port = self.port()?;
        port.write_data_terminal_ready(dtr)?;
        port.write_request_to_send(rts)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(port) = self.port.take() {
            info!("Closed {}", port.name().unwrap_or_default());
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.settings.path.clone().unwrap_or_default()
    }
}

/// Enumerate the serial ports present on the system, with a short description
/// for USB controllers.
pub fn available_ports() -> Vec<(String, String)> {
    match enumerate() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let description = match p.port_type {
                    // USB ports give us more info about the connected serial
                    // controller
                    SerialPortType::UsbPort(info) => format!(
                        "{} / {} ({:04x}:{:04x})",
                        info.manufacturer.as_deref().unwrap_or(""),
                        info.product.as_deref().unwrap_or(""),
                        info.vid,
                        info.pid
                    ),
                    _ => String::new(),
                };
                (p.port_name, description)
            })
            .collect(),
        Err(ref e) => {
            info!("error: {}", e);
            vec![]
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
    )
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn unopened_port_is_closed() {
    let mut transport = SerialTransport::new(Settings::default());
    assert!(matches!(
        transport.write_chunk(&[0xC0]),
        Err(ProtocolError::TransportClosed)
    ));
    assert!(matches!(
        transport.read_chunk(Duration::from_millis(1)),
        Err(ProtocolError::TransportClosed)
    ));
    assert!(transport.close().is_ok());
}

#[test]
fn open_without_path_is_a_validation_error() {
    let mut transport = SerialTransport::new(Settings::default());
    let err = transport.open(115_200).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
}
