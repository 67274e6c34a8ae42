//! labwire command line tool
//!
//! Drives an HCI controller over a serial port: reset it, send raw commands,
//! download a RAM image, erase flash or change the line rate.
//!
//! Usage:
//!   labwire --port /dev/ttyUSB0 reset
//!   labwire --port /dev/ttyUSB0 write-ram firmware.bin --address 0x00270400 --verify --launch
//!   labwire --simulate send 0x0C03
//!
//! `RUST_LOG` selects log output; `-v` raises the default to debug.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

use labwire_core::config::TransportConfig;
use labwire_core::protocol::decoder::hex;
use labwire_core::protocol::{
    list_ports, ports_for_serial_number, BulkTransfer, CommandPacket, HciTransport,
    DEFAULT_BAUD_RATE,
};
use labwire_core::simulator::HciSimulator;

const DEFAULT_PORT: &str = "/dev/ttyUSB0";

#[derive(Parser)]
#[command(name = "labwire", version, about = "HCI serial transport tool")]
struct Args {
    /// Serial port (default /dev/ttyUSB0)
    #[arg(short, long)]
    port: Option<String>,

    /// Pick the port by USB serial number instead of name
    #[arg(long, conflicts_with = "port")]
    probe: Option<String>,

    /// Which of the probe's ports to use
    #[arg(long, default_value_t = 0)]
    probe_port: usize,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// JSON transport settings; command line options override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable RTS/CTS flow control
    #[arg(long, default_value_t = false)]
    no_flow_control: bool,

    /// Response timeout in ms
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Attempts per command
    #[arg(long)]
    tries: Option<u32>,

    /// Talk to an in-memory controller instead of a serial port
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List serial ports
    Ports,
    /// Send HCI_Reset
    Reset,
    /// Send a raw command and print its return parameters
    Send {
        /// Opcode, e.g. 0x0C03
        #[arg(value_parser = parse_u16)]
        opcode: u16,
        /// Parameter bytes as hex, e.g. 0a0b0c
        #[arg(default_value = "")]
        params: String,
    },
    /// Download an image into controller RAM
    WriteRam {
        /// Image file
        file: PathBuf,
        /// Load address
        #[arg(long, value_parser = parse_u32)]
        address: u32,
        /// Pad byte whose chunks are skipped
        #[arg(long, value_parser = parse_u8, default_value = "0xff")]
        pad: u8,
        /// Read back a CRC after every chunk
        #[arg(long, default_value_t = false)]
        verify: bool,
        /// Enter minidriver mode first
        #[arg(long, default_value_t = false)]
        minidriver: bool,
        /// Jump to the load address afterwards
        #[arg(long, default_value_t = false)]
        launch: bool,
    },
    /// Read controller memory
    ReadRam {
        /// Start address
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Number of bytes
        length: usize,
        /// Write to a file instead of printing hex
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// CRC-32 of a memory range as computed by the controller
    Crc {
        /// Start address
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Number of bytes
        length: u32,
    },
    /// Erase all flash
    Erase {
        /// Seconds to wait for the erase to finish
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Switch the controller and the local port to a new rate
    Baud {
        /// New baud rate
        rate: u32,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => (h, 16),
        None => (s, 10),
    };
    u32::from_str_radix(&digits.replace('_', ""), radix).map_err(|e| e.to_string())
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let v = parse_u32(s)?;
    u16::try_from(v).map_err(|_| format!("{} does not fit in 16 bits", s))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let v = parse_u32(s)?;
    u8::try_from(v).map_err(|_| format!("{} does not fit in 8 bits", s))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
    if !s.is_ascii() {
        bail!("non-hex characters in '{}'", s);
    }
    if s.len() % 2 != 0 {
        bail!("odd number of hex digits in '{}'", s);
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .with_context(|| format!("bad hex '{}'", s))
        })
        .collect()
}

fn transport_config(args: &Args) -> Result<TransportConfig> {
    let mut config = match &args.config {
        Some(path) => TransportConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TransportConfig::hci(DEFAULT_PORT, DEFAULT_BAUD_RATE),
    };
    if let Some(port) = &args.port {
        config.port_name = port.clone();
    }
    if let Some(serial) = &args.probe {
        let ports = ports_for_serial_number(serial);
        let port = ports.get(args.probe_port).with_context(|| {
            format!(
                "probe {} has {} ports, wanted index {}",
                serial,
                ports.len(),
                args.probe_port
            )
        })?;
        config.port_name = port.name.clone();
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if args.no_flow_control {
        config.flow_control = false;
    }
    if let Some(ms) = args.timeout_ms {
        config.response_timeout_ms = ms;
    }
    if let Some(tries) = args.tries {
        config.tries = tries;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    if let Cmd::Ports = args.command {
        for port in list_ports() {
            println!(
                "{}\t{}\t{}",
                port.name,
                port.product.as_deref().unwrap_or("-"),
                port.serial_number.as_deref().unwrap_or("-")
            );
        }
        return Ok(());
    }

    let config = transport_config(&args)?;
    let (transport, _simulator) = if args.simulate {
        let (transport, simulator) = HciSimulator::connect(config)?;
        (transport, Some(simulator))
    } else {
        let port = config.port_name.clone();
        let transport = HciTransport::hci(config);
        transport
            .open()
            .with_context(|| format!("opening {}", port))?;
        (transport, None)
    };

    match args.command {
        Cmd::Ports => {}
        Cmd::Reset => {
            transport.reset()?;
            println!("reset ok");
        }
        Cmd::Send { opcode, params } => {
            let command = CommandPacket::new(opcode, parse_hex_bytes(&params)?)?;
            let payload = transport.send_command(&command)?;
            println!("{}", hex(&payload));
        }
        Cmd::WriteRam {
            file,
            address,
            pad,
            verify,
            minidriver,
            launch,
        } => {
            let image =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            if minidriver {
                transport.download_minidriver()?;
            }
            let start = Instant::now();
            BulkTransfer::ram(&transport).write(address, &image, pad, verify)?;
            info!(
                "wrote {} bytes in {:.2}s",
                image.len(),
                start.elapsed().as_secs_f64()
            );
            if launch {
                transport.launch_ram(address)?;
            }
            println!("write ok");
        }
        Cmd::ReadRam {
            address,
            length,
            out,
        } => {
            let data = BulkTransfer::ram(&transport).read(address, length)?;
            match out {
                Some(path) => std::fs::write(&path, &data)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", hex(&data)),
            }
        }
        Cmd::Crc { address, length } => {
            println!("{:#010x}", transport.verify_crc(address, length)?);
        }
        Cmd::Erase { timeout_secs } => {
            transport.chip_erase(Duration::from_secs(timeout_secs))?;
            println!("erase ok");
        }
        Cmd::Baud { rate } => {
            transport.change_baud_rate(rate)?;
            println!("baud rate {}", rate);
        }
    }

    let counters = transport.counters();
    info!(
        tx_bytes = counters.tx_bytes,
        rx_bytes = counters.rx_bytes,
        discarded_frames = counters.discarded_frames,
        "done"
    );
    transport.close();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("labwire {}", labwire_core::VERSION);
    run(args)
}
