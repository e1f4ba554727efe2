use std::fs;
use std::process::exit;

use clap::{Args, Parser, Subcommand};
use colored::*;
use inquire::Select;
use stc_isp::{models, ProgramConfig, Programmer, ProtocolId};

mod settings;
mod transport;

use settings::Settings;
use transport::SerialTransport;

#[derive(Parser)]
#[clap(name = "stcflash")]
#[clap(about = "Serial flasher for STC 8051-compatible microcontrollers")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the target and print what it reports about itself.
    Detect(ConnectArgs),
    /// Erase the target's flash and program a firmware image.
    Flash(Flash),
    /// Erase the target's flash without programming.
    Erase(ConnectArgs),
    /// List the supported models.
    Models,
}

#[derive(Args)]
struct ConnectArgs {
    /// Serial port; prompts with a list of available ports if omitted.
    #[clap(short, long)]
    port: Option<String>,
    /// Baud rate of the initial status exchange.
    #[clap(long)]
    handshake_baud: Option<u32>,
    /// Negotiated transfer baud rate.
    #[clap(long)]
    transfer_baud: Option<u32>,
    /// Force a protocol family (stc89, stc89a, stc12, stc15a, stc15,
    /// stc8, stc8d, stc8g, stc32) instead of auto-detecting.
    #[clap(long)]
    protocol: Option<String>,
    /// How long to wait for the target to power up, in milliseconds.
    #[clap(long, default_value_t = 10_000)]
    timeout: u32,
    /// Remember the port and baud rates for the next run.
    #[clap(long)]
    save: bool,
}

#[derive(Args)]
struct Flash {
    /// Raw binary firmware image.
    image: String,
    #[clap(flatten)]
    connect: ConnectArgs,
    /// Desired run frequency in Hz for the calibrated families.
    #[clap(long)]
    target_freq: Option<f64>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Detect(args) => detect(&args),
        Commands::Flash(flash) => flash_image(&flash),
        Commands::Erase(args) => erase(&args),
        Commands::Models => list_models(),
    }
}

fn detect(args: &ConnectArgs) {
    let mut programmer = connect(args);
    print_mcu_info(&programmer);
    let _ = programmer.disconnect();
}

fn flash_image(flash: &Flash) {
    let firmware = match fs::read(&flash.image) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("{} {e}", "error: cannot read image:".red());
            exit(1);
        }
    };
    if firmware.is_empty() || firmware.len() > 0x20000 {
        eprintln!("{}", "error: image is empty or too large.".red());
        exit(1);
    }

    let mut programmer = connect(&flash.connect);
    print_mcu_info(&programmer);

    let flash_size = programmer.mcu_info().flash_size;
    if flash_size > 0 && firmware.len() as u32 > flash_size {
        eprintln!(
            "{} image is {} bytes but the target has {} bytes of flash.",
            "error:".red(),
            firmware.len(),
            flash_size
        );
        exit(1);
    }

    programmer.on_progress(|current, total| {
        print!("\rflashing: {current}/{total}");
        let _ = std::io::Write::flush(&mut std::io::stdout());
    });

    let config = ProgramConfig {
        target_frequency: flash.target_freq,
        ..ProgramConfig::default()
    };
    match programmer.program(&firmware, &config) {
        Ok(()) => println!("\n{}", "flashing done.".green().bold()),
        Err(e) => {
            eprintln!("\n{} {e}", "error:".red());
            exit(1);
        }
    }
}

fn erase(args: &ConnectArgs) {
    let mut programmer = connect(args);
    print_mcu_info(&programmer);
    match programmer.erase_only(false) {
        Ok(()) => println!("{}", "erase done.".green().bold()),
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            exit(1);
        }
    }
}

fn list_models() {
    println!("{:<6} {:<16} {:>9} {:>8}  {}", "magic", "model", "flash", "eeprom", "protocol");
    for model in models() {
        println!(
            "{:04X}   {:<16} {:>9} {:>8}  {}",
            model.magic,
            model.name,
            model.flash_size,
            model.eeprom_size,
            model.protocol.display_name()
        );
    }
}

/// Open the port and run the connect/select steps, exiting with a
/// message on failure.
fn connect(args: &ConnectArgs) -> Programmer {
    let mut settings = Settings::load();
    let port = pick_port(args, &settings);
    let handshake_baud = args.handshake_baud.unwrap_or(settings.handshake_baud);
    let transfer_baud = args.transfer_baud.unwrap_or(settings.transfer_baud);

    if args.save {
        settings.port = Some(port.clone());
        settings.handshake_baud = handshake_baud;
        settings.transfer_baud = transfer_baud;
        if let Err(e) = settings.save() {
            eprintln!("{} {e}", "warning: cannot save settings:".yellow());
        }
    }

    let serial = match SerialTransport::open(&port, handshake_baud) {
        Ok(serial) => serial,
        Err(e) => {
            eprintln!("{} {e}", "error: cannot open port:".red());
            exit(1);
        }
    };

    let mut programmer = Programmer::new(Box::new(serial));
    programmer.comm_config_mut().baud_handshake = handshake_baud;
    programmer.comm_config_mut().baud_transfer = transfer_baud;

    if let Some(name) = &args.protocol {
        match name.parse::<ProtocolId>() {
            Ok(proto) => programmer.set_mode_manual(proto),
            Err(_) => {
                eprintln!("{} {name}", "error: unknown protocol:".red());
                exit(1);
            }
        }
    }

    println!("{}", "power-cycle the target now...".bright_blue());
    if let Err(e) = programmer.connect(args.timeout) {
        eprintln!("{} {e}", "error:".red());
        exit(1);
    }
    if let Err(e) = programmer.select_protocol() {
        eprintln!("{} {e}", "error:".red());
        exit(1);
    }
    programmer
}

fn pick_port(args: &ConnectArgs, settings: &Settings) -> String {
    if let Some(port) = &args.port {
        return port.clone();
    }
    if let Some(port) = &settings.port {
        return port.clone();
    }
    let ports = serialport::available_ports().expect("list serial ports");
    let mut names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();
    names.sort();
    Select::new("Select a serial port", names)
        .prompt()
        .expect("select serial port")
}

fn print_mcu_info(programmer: &Programmer) {
    let info = programmer.mcu_info();
    let model = info.model_name.unwrap_or("<unknown>");
    println!(
        "target: {} (magic {:04X}), protocol {}",
        model.bold(),
        info.magic,
        programmer
            .detected_protocol()
            .map(|p| p.display_name())
            .unwrap_or("<none>")
    );
    println!(
        "flash: {} bytes, eeprom: {} bytes, clock: {:.3} MHz, BSL {}",
        info.flash_size,
        info.eeprom_size,
        info.clock_hz / 1e6,
        info.bsl_version_str
    );
}
