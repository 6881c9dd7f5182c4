use clap::Parser as _;
use renogy_rover_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Tools for talking to a Renogy Rover Li solar charge controller.
#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Read(commands::read::Args),
    Monitor(commands::monitor::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter = match std::env::var("RENOGY_ROVER_TOOLS_LOG") {
        Ok(description) => match description.parse::<tracing_subscriber::filter::Targets>() {
            Ok(targets) => targets,
            Err(e) => {
                eprintln!("warning: could not parse RENOGY_ROVER_TOOLS_LOG: {e}");
                tracing_subscriber::filter::Targets::new()
            }
        },
        Err(_) => tracing_subscriber::filter::Targets::new(),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Monitor(args) => end(commands::monitor::run(args)),
    }
}
