use std::path::PathBuf;

use anyhow::Context;
use busloop::{
    codec, config, daemon, message, panic_handler, Bus, BusKind, CallOptions, Config, MethodCall,
    OutgoingSignal, Value,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "busloop")]
#[command(author, version, about = "Message-bus RPC client and demo server", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Bus to connect to
    #[arg(long, global = true, value_enum, default_value_t = BusArg::Session)]
    bus: BusArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BusArg {
    Session,
    System,
}

impl From<BusArg> for BusKind {
    fn from(arg: BusArg) -> Self {
        match arg {
            BusArg::Session => BusKind::Session,
            BusArg::System => BusKind::System,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo Echo object on the bus socket
    Serve,

    /// Call a method and print the reply
    Call {
        /// Destination bus name
        destination: String,
        /// Object path
        path: String,
        /// Interface name
        interface: String,
        /// Method name
        method: String,

        /// Argument signature (e.g. "si")
        #[arg(short, long, default_value = "")]
        signature: String,

        /// Reply timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Arguments, parsed according to the signature
        args: Vec<String>,
    },

    /// Emit a signal
    Emit {
        /// Object path
        path: String,
        /// Interface name
        interface: String,
        /// Signal name
        signal: String,

        /// Unicast to this listener instead of broadcasting
        #[arg(short, long)]
        destination: Option<String>,

        /// Argument signature (e.g. "s")
        #[arg(short, long, default_value = "")]
        signature: String,

        /// Arguments, parsed according to the signature
        args: Vec<String>,
    },

    /// Print the introspection XML of an object
    Introspect {
        /// Destination bus name
        destination: String,
        /// Object path
        path: String,
    },

    /// Show configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

fn init_logging(verbose: bool, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("busloop=debug")
        } else {
            EnvFilter::new(format!("busloop={}", level))
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

fn print_reply(values: &[Value]) {
    for value in values {
        match value {
            Value::Str(text) => println!("{}", text),
            other => println!("{}", other),
        }
    }
}

fn main() -> anyhow::Result<()> {
    panic_handler::install();
    let cli = Cli::parse();
    let kind = BusKind::from(cli.bus);
    let setup = || -> anyhow::Result<Config> {
        let config = load_config(cli.config.as_ref())?;
        init_logging(cli.verbose, &config.logging.level);
        Ok(config)
    };

    match cli.command {
        Commands::Serve => {
            let config = setup()?;
            info!("Starting busloop server...");
            daemon::Daemon::new(config, kind).run()?;
        }

        Commands::Call {
            ref destination,
            ref path,
            ref interface,
            ref method,
            ref signature,
            timeout,
            ref args,
        } => {
            let values = codec::parse_args(signature, args)?;
            let mut options = CallOptions::new().signature(signature);
            if let Some(secs) = timeout {
                options = options.with_timeout_secs(secs);
            }
            let call = MethodCall::new(destination, path, interface, method)?
                .options(options)
                .args(values);

            let config = setup()?;
            let bus = Bus::new(&config)?;
            let conn = bus.open(kind)?;
            let reply = conn.call(call)?;
            debug!("Waiting for reply to call {}", reply.serial());
            let values = bus.block_on(reply)??;
            print_reply(&values);
        }

        Commands::Emit {
            ref path,
            ref interface,
            ref signal,
            ref destination,
            ref signature,
            ref args,
        } => {
            let values = codec::parse_args(signature, args)?;
            let signal = OutgoingSignal::new(path, interface, signal)?
                .destination(destination.as_deref())?
                .signature(signature)
                .args(values);

            let config = setup()?;
            let bus = Bus::new(&config)?;
            let conn = bus.open(kind)?;
            conn.emit(signal)?;
            conn.close()?;
        }

        Commands::Introspect {
            ref destination,
            ref path,
        } => {
            let call = MethodCall::new(destination, path, message::INTROSPECTABLE, "Introspect")?;

            let config = setup()?;
            let bus = Bus::new(&config)?;
            let conn = bus.open(kind)?;
            let reply = conn.call(call)?;
            let values = bus.block_on(reply)??;
            print_reply(&values);
        }

        Commands::Config { show } => {
            init_logging(cli.verbose, "warn");
            if show {
                config::show(cli.config.as_deref())?;
            } else {
                let path = match &cli.config {
                    Some(path) => path.clone(),
                    None => Config::config_path()?,
                };
                println!("Config file: {}", path.display());
            }
        }
    }

    Ok(())
}
