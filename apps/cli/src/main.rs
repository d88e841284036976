mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use cloner_core::transfer::WriteLayout;
use cloner_core::{ClonerSession, EngineConfig, ReadProtocol, WriteOptions};
use tracing::info;

use crate::progress::ProgressObserver;

/// Parse a string as a hex or decimal u32
fn parse_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

fn parse_read_protocol(s: &str) -> Result<ReadProtocol, String> {
    match s {
        "addressed" => Ok(ReadProtocol::Addressed),
        "nand-ops" | "nand_ops" => Ok(ReadProtocol::NandOps),
        "handshake" => Ok(ReadProtocol::Handshake),
        _ => Err(format!(
            "Unknown read protocol '{}' (addressed, nand-ops, handshake)",
            s
        )),
    }
}

#[derive(Parser, Debug)]
#[command(name = "cloner")]
#[command(author, version, about = "Ingenic USB flash cloner (Pure Rust)", long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// USB bus of the target device
    #[arg(long, global = true, requires = "device")]
    bus: Option<u8>,

    /// USB address of the target device
    #[arg(long, global = true, requires = "bus")]
    device: Option<u8>,

    /// Wait for a device to appear before opening it
    #[arg(long, global = true)]
    wait: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected devices
    List {
        /// Open bootrom-PID devices and ask for their stage
        #[arg(long)]
        ask_stage: bool,
    },

    /// Identify the connected device
    Info,

    /// Read flash to a file
    Read {
        #[arg(short, long)]
        output: PathBuf,

        /// Start address (defaults to the configured base)
        #[arg(long, value_parser = parse_u32)]
        address: Option<u32>,

        /// Bytes to read (defaults to the configured flash size)
        #[arg(long, value_parser = parse_u32)]
        length: Option<u32>,

        /// How chunks are requested: addressed, nand-ops or handshake
        #[arg(long, value_parser = parse_read_protocol)]
        protocol: Option<ReadProtocol>,
    },

    /// Write a file to flash
    Write {
        #[arg(short, long)]
        input: PathBuf,

        /// Target address (defaults to the configured write address)
        #[arg(long, value_parser = parse_u32)]
        address: Option<u32>,

        /// Append the image CRC32
        #[arg(long)]
        crc: bool,

        /// Flush the device cache afterwards
        #[arg(long)]
        flush: bool,

        /// Wait for the flash erase before sending data
        #[arg(long)]
        erase_wait: bool,

        /// Announce each chunk with a handshake and check its status
        #[arg(long)]
        handshake: bool,
    },

    /// Run a multi-region write layout
    WriteLayout {
        /// Layout file (TOML), or "vendor-t31" for the built-in capture
        #[arg(short, long)]
        layout: String,

        /// One payload file per region, in region order
        #[arg(short, long, required = true)]
        payload: Vec<PathBuf>,
    },

    /// Print the effective configuration
    DumpConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = load_config(args.config.as_ref())?;
    if let Command::Read {
        protocol: Some(protocol),
        ..
    } = &args.command
    {
        config.read_protocol = *protocol;
    }
    let session = ClonerSession::with_observer(config, Arc::new(ProgressObserver::default()));
    let target = args.bus.zip(args.device);

    let open = || -> Result<_> {
        if args.wait && target.is_none() {
            session.wait_for_device()?;
        }
        Ok(session.open(target)?)
    };

    match args.command {
        Command::List { ask_stage } => {
            let devices = session.list_devices(ask_stage)?;
            if devices.is_empty() {
                println!("No devices found");
            }
            for device in devices {
                println!("{}", device);
            }
        }
        Command::Info => {
            let device = open()?;
            if let Some(id) = device.identification() {
                println!("VID:PID   {:04x}:{:04x}", device.vendor_id(), device.product_id());
                println!("Stage     {}", device.stage().map_or("unknown".into(), |s| s.to_string()));
                println!("Magic     {}", id.clean_magic);
                println!("Raw       {}", id.raw_hex());
                println!("Variant   {}", id.variant());
            }
            device.close();
        }
        Command::Read {
            output,
            address,
            length,
            ..
        } => {
            let config = session.config();
            let address = address.unwrap_or(config.base_address);
            let length = length.unwrap_or(config.flash_size);
            let device = open()?;
            let buffer = session.read_region(device, address, length)?;
            buffer
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(
                path = %output.display(),
                bytes = buffer.len(),
                crc32 = %format!("0x{:08X}", buffer.crc32()),
                "Firmware saved"
            );
        }
        Command::Write {
            input,
            address,
            crc,
            flush,
            erase_wait,
            handshake,
        } => {
            let address = address.unwrap_or(session.config().write_address);
            let options = WriteOptions {
                flush_cache: flush,
                append_crc: crc,
                erase_wait,
                handshake,
            };
            let device = open()?;
            session.write_file(device, address, &input, &options)?;
        }
        Command::WriteLayout { layout, payload } => {
            let layout = if layout == "vendor-t31" {
                cloner_core::layouts::vendor_t31_capture()
            } else {
                WriteLayout::load_from_file(&layout)
                    .with_context(|| format!("loading layout {}", layout))?
            };
            if payload.len() != layout.regions.len() {
                bail!(
                    "layout '{}' has {} regions but {} payloads were given",
                    layout.name,
                    layout.regions.len(),
                    payload.len()
                );
            }
            let data = payload
                .iter()
                .map(|p| std::fs::read(p).with_context(|| format!("reading {}", p.display())))
                .collect::<Result<Vec<_>>>()?;
            let slices: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();

            let device = open()?;
            session.write_layout(device, &layout, &slices)?;
        }
        Command::DumpConfig => {
            print!("{}", toml::to_string_pretty(session.config())?);
        }
    }

    Ok(())
}
