//! Espcom command line interface.

use std::process;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace, LevelFilter};
use simplelog::*;

use espcom::{
    self as ec, DataBits, DeviceInfo, ErrorKind, FlowControl, Parity, ProtocolError, Session,
    SerialTransport, Stage, StatusEvent, StatusSink, StopBits,
};

fn main() {
    println!("[EC] espcom v{}", crate_version!());

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Espcom connects to the serial bootloader of an Espressif chip, \
            syncs with its ROM loader and identifies the chip: its name, MAC \
            address and security configuration.\n\
            \n\
            The handshake goes through the following stages: \n\
               \t* open the port and reset the chip into its bootloader \n\
               \t* sync with the ROM loader \n\
               \t* query the chip identity and security info \n\
               \t* optionally switch the link to a faster baud rate \n\
            \n\
            When no port is given, the connected serial ports are listed for \
            interactive selection. Ctrl+C cancels the handshake at the next \
            step.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the serial port the chip is connected to")
                .long_help(
                    "the serial port the chip is connected to; when not set, \
                     the connected ports are listed for selection.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("initial baud rate, the one the ROM loader syncs at")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLASH_BAUD")
                .help("baud rate to switch to once the chip is identified")
                .long("--flash-baud")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("DATA_BITS")
                .help("number of bits per character")
                .short("-d")
                .long("--data-bits")
                .takes_value(true)
                .possible_values(&["5", "6", "7", "8"])
                .default_value("8")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STOP_BITS")
                .help("number of stop bits per byte")
                .short("-s")
                .long("--stop-bits")
                .takes_value(true)
                .possible_values(&["1", "2"])
                .default_value("1")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PARITY")
                .help("parity checking protocol")
                .short("-p")
                .long("--parity")
                .takes_value(true)
                .possible_values(&["none", "odd", "even"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLOW_CONTROL")
                .help("flow control mode")
                .short("-f")
                .long("--flow-control")
                .takes_value(true)
                .possible_values(&["none", "soft", "hard"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("NO_RESET")
                .help("do not pulse DTR/RTS to reset the chip into its bootloader")
                .long("--no-reset"),
        )
        .arg(
            Arg::with_name("SYNC_ATTEMPTS")
                .help("number of SYNC commands sent before giving up")
                .long("--sync-attempts")
                .takes_value(true)
                .default_value("7")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("READ_REG")
                .help("register to read once connected, in hex (repeatable)")
                .long("--read-reg")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .require_equals(true),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'espcom -v -v -v' or 'espcom -vvv' vs 'espcom -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    if let Err(e) = TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("{}: could not set up logging: {}", style("warning").yellow(), e);
    }

    trace!("{:#?}", matches);

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let baud_rate = numeric_arg(&matches, "BAUD_RATE", "baud-rate");
    let sync_attempts = numeric_arg(&matches, "SYNC_ATTEMPTS", "sync-attempts");

    let data_bits = match matches.value_of("DATA_BITS").unwrap() {
        "5" => DataBits::Five,
        "6" => DataBits::Six,
        "7" => DataBits::Seven,
        "8" => DataBits::Eight,
        _ => unreachable!(),
    };

    let stop_bits = match matches.value_of("STOP_BITS").unwrap() {
        "1" => StopBits::One,
        "2" => StopBits::Two,
        _ => unreachable!(),
    };

    let parity = match matches.value_of("PARITY").unwrap() {
        "none" => Parity::None,
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => unreachable!(),
    };

    let flow_control = match matches.value_of("FLOW_CONTROL").unwrap() {
        "none" => FlowControl::None,
        "soft" => FlowControl::Software,
        "hard" => FlowControl::Hardware,
        _ => unreachable!(),
    };

    // END - Arguments with default values =====================================

    // The binary carries no stub loader, so it stays with the ROM loader.
    let mut builder = ec::SettingsBuilder::default()
        .baud_rate(baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .sync_attempts(sync_attempts)
        .reset_on_connect(!matches.is_present("NO_RESET"))
        .skip_stub(true);

    // START - Arguments with NO default values ================================

    if matches.is_present("FLASH_BAUD") {
        builder = builder.desired_baud_rate(numeric_arg(&matches, "FLASH_BAUD", "flash-baud"));
    }

    let registers: Vec<u32> = matches
        .values_of("READ_REG")
        .map(|values| values.map(hex_arg).collect())
        .unwrap_or_default();

    let path = match matches.value_of("DEVICE_TTY") {
        Some(path) => path.to_string(),
        None => select_port().unwrap_or_else(|| {
            println!("{}: no serial port selected", style("error").red());
            process::exit(-1);
        }),
    };
    builder = builder.path(path);

    // END - Arguments =========================================================

    let settings = builder.finalize();
    debug!("{:#?}", settings);

    let spinner = Spinner::new();
    let pb = spinner.pb.clone();
    let transport = SerialTransport::new(settings.clone());
    let mut session = Session::new(Box::new(transport), settings).with_status_sink(spinner);

    let cancel = session.cancel_flag();
    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C, cancelling...");
        cancel.cancel();
    })
    .unwrap_or_else(|e| debug!("no Ctrl+C handler: {}", e));

    let exit_code = match run(&mut session, &registers, &pb) {
        Ok(()) => 0,
        Err(error) => {
            report_error(&error);
            1
        }
    };
    if let Err(e) = session.close() {
        debug!("close failed: {}", e);
    }
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

// =============================================================================
// Private stuff
// =============================================================================

fn run(session: &mut Session, registers: &[u32], pb: &ProgressBar) -> ec::Result<()> {
    let connected = session.connect_and_handshake();
    pb.finish_and_clear();
    let device = connected?;
    print_device(&device, session.baud_rate());

    if !registers.is_empty() {
        for address in registers {
            let value = session.read_reg(*address)?;
            println!(
                "  {} 0x{:08x} = 0x{:08x}",
                style("reg").dim(),
                address,
                value
            );
        }
    }
    Ok(())
}

fn print_device(device: &DeviceInfo, baud_rate: u32) {
    println!(
        "👍 {} ({}) at {} baud",
        style(&device.chip_name).green(),
        style(&device.mac_address).cyan(),
        baud_rate
    );
    println!("  {} {}", style("loader").dim(), device.loader);
    match device.flash_size {
        Some(size) => println!("  {} {} bytes", style("flash").dim(), size),
        None => println!("  {} unknown", style("flash").dim()),
    }
    for fact in &device.security_facts {
        println!("  {} {}", style("security").dim(), fact);
    }
}

fn report_error(error: &ProtocolError) {
    let hint = match error.kind() {
        ErrorKind::Timeout => "the chip did not answer; is it in its bootloader?",
        ErrorKind::Cancelled => "cancelled by the user",
        ErrorKind::UnsupportedChip => "this chip is not supported",
        ErrorKind::Transport | ErrorKind::TransportClosed => {
            "the serial port failed; check the cable and the port name"
        }
        ErrorKind::Framing | ErrorKind::OpcodeMismatch | ErrorKind::InvalidResponse => {
            "the chip answered with garbage; try a lower baud rate"
        }
        ErrorKind::ChecksumOrStatus => "the bootloader rejected a command",
        ErrorKind::Validation | ErrorKind::InvalidState => "invalid request",
    };
    println!("{}: {}", style("error").red(), hint);
    println!("   {} {}", style("-->").cyan(), error);
}

fn numeric_arg(matches: &clap::ArgMatches, name: &str, long: &str) -> u32 {
    value_t!(matches.value_of(name), u32).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style(long).cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(matches.value_of(name).unwrap_or_default()).on_red()
        );
        process::exit(-1);
    })
}

fn hex_arg(value: &str) -> u32 {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a hexadecimal address",
            style("error").red(),
            style("read-reg").cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(value).on_red()
        );
        process::exit(-1);
    })
}

/// Present the connected serial ports for the user to pick one.
fn select_port() -> Option<String> {
    use dialoguer::{theme::ColorfulTheme, Select};

    let ports = ec::available_ports();
    if ports.is_empty() {
        return None;
    }
    let items: Vec<String> = ports
        .iter()
        .map(|(name, description)| {
            if description.is_empty() {
                name.clone()
            } else {
                format!("{}: ({})", name, description)
            }
        })
        .collect();

    let term = Term::buffered_stderr();
    let theme = ColorfulTheme::default();
    let selection = Select::with_theme(&theme)
        .with_prompt("Select a port to be used")
        .items(&items)
        .default(0)
        .interact_on_opt(&term)
        .ok()
        .flatten();
    selection.and_then(|index| ports.get(index).map(|(name, _)| name.clone()))
}

/// Status sink driving a spinner, with a byte count while the stub uploads.
struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(120);
        pb.set_style(
            ProgressStyle::default_spinner()
                // For more spinners check out the cli-spinners project:
                // https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
                .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
                .template("[EC] {spinner:.blue} {msg}"),
        );
        Spinner { pb }
    }

    fn describe(stage: Stage) -> &'static str {
        match stage {
            Stage::OpeningPort => "Opening the port",
            Stage::HandshakingBootloader => "Handshaking with the bootloader",
            Stage::LoadingStub => "Loading the stub",
            Stage::ReconnectingStub => "Reconnecting to the stub",
            Stage::GettingSecurityInfo => "Getting the security info",
        }
    }
}

impl StatusSink for Spinner {
    fn on_status(&mut self, event: &StatusEvent) {
        let percent = event
            .percent
            .map(|p| format!("{:3}%", p))
            .unwrap_or_default();
        self.pb.set_message(format!(
            "{} {}...",
            style(percent).dim(),
            Self::describe(event.stage)
        ));
    }

    fn on_progress(&mut self, stage: Stage, done: usize, total: usize) {
        self.pb.set_message(format!(
            "{} {}/{} bytes",
            Self::describe(stage),
            done,
            total
        ));
    }
}
