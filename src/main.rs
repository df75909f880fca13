use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use gdbremote::{
    config, ClientConfig, Codec, Endian, GdbClient, GdbServer, RegisterLayout, ServerConfig,
    SimTarget,
};

#[derive(Parser)]
#[command(author, version, about = "Remora - GDB remote protocol stub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log commands (-v) or raw protocol traffic (-vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Built-in register layout
    #[arg(long, value_enum, default_value_t = Arch::Riscv32)]
    arch: Arch,

    /// JSON register layout, overrides --arch
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Target registers are big-endian
    #[arg(long)]
    big_endian: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Arch {
    Riscv32,
    Arm,
    X86_64,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a simulated target to GDB
    Serve {
        /// JSON server configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overrides the configuration
        #[arg(short, long)]
        bind: Option<String>,

        /// Simulated RAM base address (hex or decimal)
        #[arg(long, value_parser = parse_int, default_value = "0x0")]
        ram_base: u64,

        /// Simulated RAM size in bytes
        #[arg(long, value_parser = parse_int, default_value = "0x10000")]
        ram_size: u64,
    },
    /// Connect to a stub and run one request
    Probe {
        /// Stub address
        #[arg(short, long, default_value = "localhost:1234")]
        addr: String,

        /// JSON client configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: ProbeAction,
    },
}

#[derive(Subcommand)]
enum ProbeAction {
    /// Print all registers as JSON
    Registers,
    /// Read memory from the target
    ReadMemory {
        /// Start address (hex or decimal)
        #[arg(value_parser = parse_int)]
        address: u64,

        /// Length in bytes
        #[arg(value_parser = parse_int)]
        length: u64,
    },
    /// List thread ids
    Threads,
    /// Print the target description XML
    Description,
}

fn parse_int(s: &str) -> Result<u64, String> {
    if let Some(hex_str) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex_str, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}

fn build_codec(cli: &Cli) -> Result<Codec, Box<dyn std::error::Error>> {
    let layout = match &cli.layout {
        Some(path) => config::load_layout(path)?,
        None => match cli.arch {
            Arch::Riscv32 => RegisterLayout::riscv32(),
            Arch::Arm => RegisterLayout::arm_cortex_m(),
            Arch::X86_64 => RegisterLayout::x86_64(),
        },
    };
    let endian = if cli.big_endian { Endian::Big } else { Endian::Little };
    Ok(Codec::new(layout, endian))
}

async fn serve(
    codec: Codec,
    config: Option<PathBuf>,
    bind: Option<String>,
    ram_base: u64,
    ram_size: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }

    let target = SimTarget::new(codec.layout().clone()).with_region(ram_base, ram_size);
    let server = GdbServer::new(target, codec, config);
    server.run().await?;
    Ok(())
}

async fn probe(
    codec: Codec,
    addr: String,
    config: Option<PathBuf>,
    action: ProbeAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };

    let mut client = GdbClient::connect(addr.as_str(), codec, config).await?;
    let stop = client.attach().await?;
    log::info!("Target {}", stop);

    match action {
        ProbeAction::Registers => {
            let registers = client.read_registers().await?;
            let printable: serde_json::Map<String, serde_json::Value> = registers
                .iter()
                .map(|(name, value)| (name.clone(), format!("{:#x}", value).into()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&printable)?);
        }
        ProbeAction::ReadMemory { address, length } => {
            let data = client.read_memory(address, length as usize).await?;
            println!("{}", gdbremote::codec::encode_hex(&data));
        }
        ProbeAction::Threads => {
            for thread in client.list_threads().await? {
                println!("{}", thread);
            }
        }
        ProbeAction::Description => {
            println!("{}", client.target_description().await?);
        }
    }

    client.detach().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("remora", level)
        .with_module_level("gdbremote", level)
        .init()?;

    let codec = build_codec(&cli)?;

    match cli.command {
        Commands::Serve {
            config,
            bind,
            ram_base,
            ram_size,
        } => serve(codec, config, bind, ram_base, ram_size).await,
        Commands::Probe {
            addr,
            config,
            action,
        } => probe(codec, addr, config, action).await,
    }
}
