#![allow(dangerous_implicit_autorefs)]

use log::error;
use std::path::PathBuf;

use clap::{
    crate_authors, crate_version, value_t, value_t_or_exit, App, AppSettings, Arg, ArgMatches,
    SubCommand,
};

use usbreplay::recording::{Recording, EVENT_COMPLETE, EVENT_ERROR, EVENT_SUBMIT};
use usbreplay::result::Result;
use usbreplay::usbfs::transfer_type_name;

fn event_name(event: u8) -> &'static str {
    match event {
        EVENT_SUBMIT => "submit",
        EVENT_COMPLETE => "complete",
        EVENT_ERROR => "error",
        _ => "unknown",
    }
}

fn dump_recording(path: &PathBuf, bus: Option<u16>, device: Option<u8>) -> Result<()> {
    let mut recording = Recording::open(path)?;
    let mut seq = 0u64;
    while let Some(record) = recording.next_record()? {
        let hdr = record.usb();
        seq += 1;
        if bus.map_or(false, |b| b != hdr.busnum) {
            continue;
        }
        if device.map_or(false, |d| d != hdr.devnum) {
            continue;
        }
        let payload = record
            .payload()
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "#{:<6} {}.{:06} {}:{:<3} {:8} {:11} ep 0x{:02x} len {:5} data {:5} status {:4}  {}",
            seq,
            hdr.ts_sec,
            hdr.ts_usec,
            hdr.busnum,
            hdr.devnum,
            event_name(hdr.event_type),
            transfer_type_name(hdr.xfer_type),
            hdr.epnum,
            hdr.length,
            hdr.len_cap,
            hdr.status,
            payload,
        );
    }
    Ok(())
}

fn inspect(args: &ArgMatches) {
    let path = PathBuf::from(value_t_or_exit!(args, "file", String));
    let bus = value_t!(args, "bus", u16).ok();
    let device = value_t!(args, "device", u8).ok();

    if let Err(err) = dump_recording(&path, bus, device) {
        error!("{}", err);
        std::process::exit(1);
    };
}

fn setup_logging(matches: &clap::ArgMatches) {
    if matches.is_present("verbose") {
        env_logger::Builder::new().parse_filters("debug").init();
        return;
    }

    let loglevel = matches.value_of("loglevel");
    if let Some(level) = loglevel {
        env_logger::Builder::new().parse_filters(level).init();
        return;
    }

    // default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() {
    let inspect_command = SubCommand::with_name("inspect")
        .about("Dump the USB records of a recording.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(
            Arg::with_name("file")
                .help("Recording to read (legacy pcap, DLT_USB_LINUX_MMAPPED)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("bus")
                .long("bus")
                .takes_value(true)
                .help("Only show records of this bus"),
        )
        .arg(
            Arg::with_name("device")
                .long("device")
                .takes_value(true)
                .help("Only show records of this device address"),
        );

    let main_app = App::new("usbreplay")
        .about("Serve recorded USB transaction traces to usbdevfs clients.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .conflicts_with("loglevel")
                .help("shorthand for --loglevel debug)"),
        )
        .arg(
            Arg::with_name("loglevel")
                .short("l")
                .takes_value(true)
                .help("Finegrained verbosity control. See docs.rs/env_logger. Examples: [error, warn, info, debug, trace]"),
        )
        .subcommand(inspect_command);

    let matches = main_app.get_matches();
    setup_logging(&matches);
    match matches.subcommand() {
        ("inspect", Some(sub_matches)) => inspect(sub_matches),
        ("", None) => unreachable!(), // because of AppSettings::SubcommandRequiredElseHelp
        _ => unreachable!(),
    }
}
