//! Apflash command line interface.

use std::{
    process,
    sync::atomic::{AtomicUsize, Ordering},
};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
};
use console::style;
use log::{debug, info, trace, LevelFilter};
use simplelog::*;

use apflash::{self as af, CancelFlag, Coordinator, ErrorKind, RunReport, Ssh2Transport};

fn main() {
    println!("[AF] apflash v{}", crate_version!());

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Apflash installs OpenWrt on an Enterasys WS-AP3710i access point \
            over its serial console and the network, in one unattended run:\n\
               \t* interrupts U-Boot and logs in \n\
               \t* makes U-Boot boot OpenWrt from flash from now on \n\
               \t* network boots the initramfs image served over TFTP \n\
               \t* gives the device a temporary address \n\
               \t* uploads the sysupgrade image over SSH and flashes it \n\
            \n\
            Connect the console cable and the network cable, start apflash, \
            then power the access point on. Press Ctrl+C to abort; press it \
            twice to exit immediately.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the serial port connected to the access point")
                .long_help(
                    "the serial port connected to the access point; when \
                     not set, /dev/ttyUSB1, /dev/ttyUSB0, COM4, COM3, COM2 \
                     and COM1 are tried in that order.",
                )
                .short("-t")
                .long("--tty")
                .alias("port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200"),
        )
        .arg(
            Arg::with_name("INITRAMFS")
                .help("path to the OpenWrt initramfs image booted over TFTP")
                .short("-i")
                .long("--initramfs")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("IMAGE")
                .help("path to the OpenWrt sysupgrade image to flash")
                .short("-j")
                .long("--image")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("LOCAL_IP")
                .help("address of the local interface serving TFTP, e.g. 192.168.1.10/24")
                .long("--local-ip")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("AP_IP")
                .help("temporary address of the access point")
                .long_help(
                    "temporary address of the access point; defaults to the \
                     broadcast address of the local network minus one.",
                )
                .long("--ap-ip")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("DRYRUN")
                .help("skip all steps that would make persistent changes")
                .short("-d")
                .long("--dryrun"),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // The run is unattended, progress is shown at the info level by default.
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
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

    let cancel = CancelFlag::new();
    let interrupts = AtomicUsize::new(0);
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            println!("🛑 received Ctrl+C! stopping... (press again to exit now)");
            flag.cancel();
        } else {
            process::exit(130);
        }
    })
    .expect("Failed to install the Ctrl-C handler!");

    // Arguments with default values ===========================================

    let baud_rate = value_t!(matches.value_of("BAUD_RATE"), u32).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style("baud-rate").cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(matches.value_of("BAUD_RATE").unwrap_or_default()).on_red()
        );
        process::exit(1);
    });

    let mut builder = af::SettingsBuilder::new()
        .baud_rate(baud_rate)
        .dry_run(matches.is_present("DRYRUN"));

    // Arguments with NO default values ========================================

    if let Some(path) = matches.value_of("DEVICE_TTY") {
        builder = builder.path(path);
    }
    if let Some(initramfs) = matches.value_of("INITRAMFS") {
        builder = builder.initramfs(initramfs);
    }
    if let Some(image) = matches.value_of("IMAGE") {
        builder = builder.firmware(image);
    }
    if let Some(local_ip) = matches.value_of("LOCAL_IP") {
        builder = builder.local_ip(local_ip);
    }
    if let Some(ap_ip) = matches.value_of("AP_IP") {
        builder = builder.device_ip(ap_ip);
    }
    let settings = builder.finalize();
    if settings.dry_run {
        info!("dryrun: no persistent change will be made");
    }

    // Run =====================================================================

    let exit_code = match run(settings, &cancel) {
        Ok(report) if report.succeeded() => {
            println!("{} {}", style("✔").green(), style("Firmware flashed.").bold());
            println!(
                "   Give the access point some time to reboot, then reach it on {}",
                style("http://192.168.1.1").cyan()
            );
            0
        }
        Ok(report) => {
            println!(
                "{}: the run ended without a successful upgrade ({:?})",
                style("error").red(),
                report
            );
            1
        }
        Err(e) if e.kind() == ErrorKind::UserCancellation => {
            println!("{}", style("❌ Cancelled.").yellow());
            130
        }
        Err(e) => {
            println!("{}: {}", style("error").red(), e);
            1
        }
    };
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

fn run(settings: af::Settings, cancel: &CancelFlag) -> af::Result<RunReport> {
    let coordinator = Coordinator::new(settings.clone())?;
    let session = af::open_session(&settings)?;
    let transport = Ssh2Transport::new(settings.ssh_timeout);
    coordinator.run(session, transport, cancel)
}
