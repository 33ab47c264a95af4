// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{io::Write, fs::File, time::Instant};
use clap::{Command, Arg, ArgAction, ArgMatches, crate_description, crate_version};
use clap_num::maybe_hex;
use anyhow::Context;

use iceprog::probe::{self, DeviceInfo, FtdiDevice, Interface};
use iceprog::{mpsse, board, program};
use iceprog::{Board, EraseMode, Session};

/// Default length of the `read` subcommand.
const DEFAULT_READ_SIZE: u32 = 256 * 1024;

fn cli() -> Command {
    let offset = Arg::new("offset")
        .help("Start address in bytes (decimal, 0x hex, k and M suffixes allowed)")
        .long("offset")
        .short('o')
        .action(ArgAction::Set)
        .value_parser(parse_size)
        .default_value("0");
    let unprotect = Arg::new("unprotect")
        .help("Disable write protection before erasing")
        .long("unprotect")
        .short('p')
        .action(ArgAction::SetTrue);
    let bulk = Arg::new("bulk")
        .help("Erase the entire flash instead of only the blocks being written")
        .long("bulk")
        .short('b')
        .action(ArgAction::SetTrue);

    Command::new("iceprog")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug with \
                    data dumps, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("slow")
             .help("Use a 50kHz SPI clock instead of 6MHz")
             .long("slow")
             .short('s')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("device")
             .help("VID:PID[:SN] of FTDI device to use")
             .long("device")
             .short('d')
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("interface")
             .help("Interface of the FTDI device to use (A, B, C or D)")
             .long("interface")
             .short('I')
             .action(ArgAction::Set)
             .value_parser(parse_interface)
             .default_value("A")
             .global(true))
        .subcommand(Command::new("devices")
            .about("List available FTDI devices"))
        .subcommand(Command::new("test")
            .about("Bring up the board and read the flash ID"))
        .subcommand(Command::new("disable-protection")
            .about("Clear the flash status register, disabling all write protection"))
        .subcommand(Command::new("write")
            .about("Erase, write and verify a binary file to SPI flash")
            .arg(Arg::new("file")
                 .help("File to write to SPI flash")
                 .required(true))
            .arg(offset.clone())
            .arg(bulk.clone().conflicts_with("no-erase"))
            .arg(Arg::new("no-erase")
                 .help("Do not erase before writing")
                 .long("no-erase")
                 .short('n')
                 .action(ArgAction::SetTrue))
            .arg(Arg::new("no-verify")
                 .help("Disable readback verification")
                 .long("no-verify")
                 .short('N')
                 .action(ArgAction::SetTrue))
            .arg(unprotect.clone()))
        .subcommand(Command::new("check")
            .about("Verify SPI flash contents against a binary file")
            .arg(Arg::new("file")
                 .help("File to compare against SPI flash")
                 .required(true))
            .arg(offset.clone()))
        .subcommand(Command::new("read")
            .about("Read SPI flash contents to file")
            .arg(Arg::new("file")
                 .help("File to write SPI flash contents to, or - for stdout")
                 .required(true))
            .arg(offset.clone())
            .arg(Arg::new("size")
                 .help("Length in bytes of read, defaults to 256k")
                 .long("size")
                 .short('l')
                 .action(ArgAction::Set)
                 .value_parser(parse_size)))
        .subcommand(Command::new("erase")
            .about("Erase SPI flash without writing")
            .arg(offset)
            .arg(Arg::new("size")
                 .help("Length in bytes of region to erase, rounded out to 64kB blocks")
                 .long("size")
                 .short('l')
                 .action(ArgAction::Set)
                 .value_parser(parse_size)
                 .required_unless_present("bulk"))
            .arg(bulk.conflicts_with("size"))
            .arg(unprotect))
}

fn main() {
    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            e.print().ok();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        },
    };

    if let Err(e) = run(&matches) {
        eprintln!("Error: {:?}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Listing devices does not require opening one,
    // so we just list them and quit early.
    let (name, sub) = matches.subcommand().context("no subcommand given")?;
    if name == "devices" {
        print_device_list();
        return Ok(());
    }

    // Open any files before touching the hardware,
    // so that file errors leave the board alone.
    let file_arg = || sub.get_one::<String>("file").context("missing file argument");
    let offset = sub.try_get_one::<u32>("offset").ok().flatten().copied().unwrap_or(0);
    let mut source = match name {
        "write" | "check" => {
            let path = file_arg()?;
            Some(File::open(path).with_context(|| format!("Failed to open input file {}", path))?)
        },
        _ => None,
    };
    let mut sink: Option<Box<dyn Write>> = match name {
        "read" if data_on_stdout(name, sub) => Some(Box::new(std::io::stdout())),
        "read" => {
            let path = file_arg()?;
            Some(Box::new(File::create(path)
                .with_context(|| format!("Failed to create output file {}", path))?))
        },
        _ => None,
    };

    // All commands after this point require an open board.
    let interface = matches.get_one::<Interface>("interface").copied().unwrap_or(Interface::A);
    let device = if let Some(spec) = matches.get_one::<String>("device") {
        DeviceInfo::from_specifier(spec)?.open(interface)?
    } else {
        FtdiDevice::new(interface)?
    };
    let board = Board::open(device, matches.get_flag("slow"))?;
    let mut session = Session::new(board);
    session.set_progress(!quiet);
    session.set_verbose(verbose >= 2);

    match (name, source.as_mut(), sink.as_mut()) {
        ("test", _, _) => {
            if let Some(id) = session.run(|s| Ok(s.id().cloned()))? {
                println!("{}", id);
                println!("Raw ID: {}", id.to_hex());
            }
        },
        ("disable-protection", _, _) => {
            session.run(|s| s.disable_protection())?;
            if !quiet { println!("Flash protection disabled.") };
        },
        ("write", Some(file), _) => {
            let erase = if sub.get_flag("no-erase") {
                EraseMode::Skip
            } else if sub.get_flag("bulk") {
                EraseMode::Bulk
            } else {
                EraseMode::Range
            };
            let verify = !sub.get_flag("no-verify");
            let unprotect = sub.get_flag("unprotect");
            session.run(|s| {
                if unprotect {
                    s.disable_protection()?;
                }
                s.program(file, offset, erase, verify)
            })?;
            if !quiet && verify { println!("Verified OK.") };
        },
        ("check", Some(file), _) => {
            session.run(|s| s.verify(file, offset))?;
            if !quiet { println!("Verified OK.") };
        },
        ("read", _, Some(sink)) => {
            let size = sub.get_one::<u32>("size").copied().unwrap_or(DEFAULT_READ_SIZE);
            session.run(|s| s.read(sink, offset, size))?;
        },
        ("erase", _, _) => {
            let unprotect = sub.get_flag("unprotect");
            let size = sub.get_one::<u32>("size").copied();
            session.run(|s| {
                if unprotect {
                    s.disable_protection()?;
                }
                match size {
                    Some(size) => s.erase(offset, size),
                    None => s.bulk_erase(),
                }
            })?;
        },
        _ => anyhow::bail!("Unhandled command {}.", name),
    }

    let t1 = t0.elapsed();
    if !quiet {
        let done = format!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
        if data_on_stdout(name, sub) {
            eprintln!("{}", done);
        } else {
            println!("{}", done);
        }
    }

    Ok(())
}

/// Map a top-level error onto the process exit code.
///
/// Session errors carry their own code. Failing to find or open the
/// adapter counts as a hardware error, anything else, including a
/// malformed device specifier, as a user error.
fn exit_code(e: &anyhow::Error) -> i32 {
    if let Some(e) = e.downcast_ref::<program::Error>() {
        e.exit_code()
    } else if let Some(probe::Error::InvalidSpecifier) = e.downcast_ref::<probe::Error>() {
        1
    } else if e.is::<probe::Error>() || e.is::<mpsse::Error>() || e.is::<board::Error>() {
        2
    } else {
        1
    }
}

/// Parse a byte count or address, in decimal or 0x-prefixed hex,
/// with an optional binary `k` or `M` suffix.
/// True when the command writes flash contents to stdout,
/// in which case status messages must go to stderr.
fn data_on_stdout(name: &str, sub: &ArgMatches) -> bool {
    name == "read" && sub.get_one::<String>("file").map(String::as_str) == Some("-")
}

fn parse_size(s: &str) -> Result<u32, String> {
    let (number, multiplier) = if let Some(number) = s.strip_suffix('k') {
        (number, 1024)
    } else if let Some(number) = s.strip_suffix('M') {
        (number, 1024 * 1024)
    } else {
        (s, 1)
    };
    maybe_hex::<u32>(number)?
        .checked_mul(multiplier)
        .ok_or_else(|| format!("{} is too large", s))
}

fn parse_interface(s: &str) -> Result<Interface, probe::Error> {
    s.parse()
}

fn print_device_list() {
    let devices = DeviceInfo::list();
    if devices.is_empty() {
        println!("No FTDI devices found.");
    } else {
        println!("Found {} FTDI device{}:", devices.len(),
                 if devices.len() == 1 { "" } else { "s" });
        for device in devices {
            println!("  {}", device);
        }
    }
}
