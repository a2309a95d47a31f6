//! Settings related to the serial port and to the bootloader protocol client.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

/// Baud rate every ROM loader listens at after reset.
pub const DEFAULT_ROM_BAUD: u32 = 115_200;
/// Baud rate commonly used once the handshake is done.
pub const DEFAULT_FLASH_BAUD: u32 = 921_600;

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all settings used by a [`Session`](crate::Session) and its serial
/// transport.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path.
    pub path: Option<String>,
    /// The baud rate the port is opened at. The ROM loader auto-detects it
    /// during sync.
    pub baud_rate: u32,
    /// When set and different from `baud_rate`, the handshake ends by
    /// switching the link to this baud rate.
    pub desired_baud_rate: Option<u32>,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,

    /// Keep talking to the ROM loader instead of uploading the stub.
    pub skip_stub: bool,
    /// Pulse DTR/RTS to reset the chip into its bootloader before syncing.
    pub reset_on_connect: bool,
    /// How many SYNC commands are sent before giving up.
    pub sync_attempts: u32,
    /// Pause between two SYNC attempts.
    pub retry_backoff: Duration,
    /// Time budget of a single SYNC exchange.
    pub sync_timeout: Duration,
    /// Time budget of register and baud rate commands.
    pub command_timeout: Duration,
    /// Time budget of each stub upload exchange, and of the stub greeting.
    pub stub_timeout: Duration,
    /// Time budget of the identity and security info queries.
    pub identity_timeout: Duration,
    /// Fail with `OpcodeMismatch` instead of discarding responses to other
    /// commands.
    pub strict_correlation: bool,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

impl Settings {
    /// The baud rate to switch to at the end of the handshake, if any.
    pub fn baud_switch(&self) -> Option<u32> {
        self.desired_baud_rate.filter(|baud| *baud != self.baud_rate)
    }
}

impl Default for Settings {
    fn default() -> Self {
        SettingsBuilder::new().finalize()
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use espcom::SettingsBuilder;
///
/// let settings = SettingsBuilder::new()
///     .path("/dev/ttyUSB0")
///     .desired_baud_rate(921_600)
///     .finalize();
/// assert_eq!(settings.baud_switch(), Some(921_600));
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: DEFAULT_ROM_BAUD,
                desired_baud_rate: None,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                skip_stub: false,
                reset_on_connect: true,
                sync_attempts: 7,
                retry_backoff: Duration::from_millis(50),
                sync_timeout: Duration::from_millis(100),
                command_timeout: Duration::from_secs(3),
                stub_timeout: Duration::from_secs(3),
                identity_timeout: Duration::from_secs(3),
                strict_correlation: false,
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().as_ref().to_owned());
        self
    }

    /// Set the baud rate the port is opened at
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the baud rate to switch to once the handshake is done
    pub fn desired_baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.desired_baud_rate = Some(baud_rate);
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    /// Stay with the ROM loader instead of uploading the stub
    pub fn skip_stub(mut self, skip_stub: bool) -> Self {
        self.settings.skip_stub = skip_stub;
        self
    }

    /// Reset the chip into its bootloader through DTR/RTS before syncing
    pub fn reset_on_connect(mut self, reset_on_connect: bool) -> Self {
        self.settings.reset_on_connect = reset_on_connect;
        self
    }

    /// Set how many SYNC commands are sent before giving up
    pub fn sync_attempts(mut self, sync_attempts: u32) -> Self {
        self.settings.sync_attempts = sync_attempts.max(1);
        self
    }

    /// Set the pause between two SYNC attempts
    pub fn retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.settings.retry_backoff = retry_backoff;
        self
    }

    /// Set the time budget of a single SYNC exchange
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.settings.sync_timeout = timeout;
        self
    }

    /// Set the time budget of register and baud rate commands
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.settings.command_timeout = timeout;
        self
    }

    /// Set the time budget of the stub upload exchanges
    pub fn stub_timeout(mut self, timeout: Duration) -> Self {
        self.settings.stub_timeout = timeout;
        self
    }

    /// Set the time budget of the identity and security info queries
    pub fn identity_timeout(mut self, timeout: Duration) -> Self {
        self.settings.identity_timeout = timeout;
        self
    }

    /// Fail on responses to other commands instead of discarding them
    pub fn strict_correlation(mut self, strict: bool) -> Self {
        self.settings.strict_correlation = strict;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.path, None);
    assert_eq!(settings.baud_rate, 115_200);
    assert_eq!(settings.desired_baud_rate, None);
    assert_eq!(settings.data_bits, DataBits::Eight);
    assert_eq!(settings.flow_control, FlowControl::None);
    assert_eq!(settings.parity, Parity::None);
    assert_eq!(settings.stop_bits, StopBits::One);
    assert!(!settings.skip_stub);
    assert!(settings.reset_on_connect);
    assert_eq!(settings.sync_attempts, 7);
    assert_eq!(settings.sync_timeout, Duration::from_millis(100));
    assert!(!settings.strict_correlation);
    assert_eq!(settings, Settings::default());
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn baud_switch_only_when_different() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.baud_switch(), None);

    let settings = SettingsBuilder::new()
        .desired_baud_rate(DEFAULT_ROM_BAUD)
        .finalize();
    assert_eq!(settings.baud_switch(), None);

    let settings = SettingsBuilder::new()
        .desired_baud_rate(DEFAULT_FLASH_BAUD)
        .finalize();
    assert_eq!(settings.baud_switch(), Some(DEFAULT_FLASH_BAUD));
}

#[test]
fn sync_attempts_never_zero() {
    let settings = SettingsBuilder::new().sync_attempts(0).finalize();
    assert_eq!(settings.sync_attempts, 1);
}

#[test]
fn serial_line() {
    let settings = SettingsBuilder::new()
        .data_bits(DataBits::Seven)
        .flow_control(FlowControl::Hardware)
        .stop_bits(StopBits::Two)
        .parity(Parity::Even)
        .finalize();
    assert_eq!(settings.data_bits, DataBits::Seven);
    assert_eq!(settings.flow_control, FlowControl::Hardware);
    assert_eq!(settings.stop_bits, StopBits::Two);
    assert_eq!(settings.parity, Parity::Even);
}

#[test]
fn timeouts() {
    let settings = SettingsBuilder::new()
        .sync_timeout(Duration::from_millis(20))
        .command_timeout(Duration::from_millis(200))
        .stub_timeout(Duration::from_millis(300))
        .identity_timeout(Duration::from_millis(400))
        .retry_backoff(Duration::from_millis(0))
        .finalize();
    assert_eq!(settings.sync_timeout, Duration::from_millis(20));
    assert_eq!(settings.command_timeout, Duration::from_millis(200));
    assert_eq!(settings.stub_timeout, Duration::from_millis(300));
    assert_eq!(settings.identity_timeout, Duration::from_millis(400));
    assert_eq!(settings.retry_backoff, Duration::from_millis(0));
}
