//! Bootmaster command line interface.

use std::error::Error as StdError;
use std::path::Path;
use std::process::{self, Command};
use std::sync::Arc;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches, SubCommand,
};
use console::style;
use dialoguer::Confirm;
use log::{debug, trace, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use bootmaster::power;
use bootmaster::{self as bm, Board, DeployRequest, KernelOverride, SystemShell, Target};

fn main() {
    println!("[BM] bootmaster v{}", crate_version!());

    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(130);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let board_arg = || {
        Arg::with_name("BOARD")
            .help("hostname of the board, as named in the configuration")
            .required(true)
            .index(1)
    };

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Bootmaster boots a board into its master image, a minimal \
            recovery environment started over the network, and provisions its \
            test partitions from there.\n\
            \n\
            `deploy` composes a disk image out of a hardware pack and a root \
            filesystem, then has the board pull the boot and root partitions \
            of that image onto its storage.\n\
            \n\
            `fs` pulls a directory of a board partition to the host, runs a \
            command in it, and pushes the result back.\n\
            \n\
            `boot` hands the board back to its test partitions.\n\
            \n\
            `power` drives the power controller of the board.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .setting(SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("CONFIG")
                .help("path to the configuration file")
                .short("-c")
                .long("--config")
                .takes_value(true)
                .default_value("/etc/bootmaster/bootmaster.toml")
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help(
                    "Sets the logging level of verbosity, repeat several times for \
                    higher verbosity",
                ),
        )
        .subcommand(
            SubCommand::with_name("deploy")
                .about("deploy a hardware pack and a root filesystem on a board")
                .arg(board_arg())
                .arg(
                    Arg::with_name("HWPACK")
                        .help("URL of the hardware pack")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("ROOTFS")
                        .help("URL of the root filesystem tarball")
                        .required(true)
                        .index(3),
                )
                .arg(
                    Arg::with_name("KERNEL")
                        .help("URL of a kernel .deb replacing the one of the hardware pack")
                        .short("-k")
                        .long("--kernel")
                        .takes_value(true)
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("KERNEL_PREFIX")
                        .help("name prefix of the kernel packages being replaced")
                        .long("--kernel-prefix")
                        .takes_value(true)
                        .default_value("linux-image")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("NO_CACHE")
                        .help("always download, bypassing the image cache")
                        .long("--no-cache"),
                )
                .arg(
                    Arg::with_name("YES")
                        .help("do not ask for confirmation before formatting")
                        .short("-y")
                        .long("--yes"),
                )
                .arg(
                    Arg::with_name("BOOT")
                        .help("boot the board from its test partitions once deployed")
                        .short("-b")
                        .long("--boot"),
                ),
        )
        .subcommand(
            SubCommand::with_name("fs")
                .about("run a host command inside a directory of a board partition")
                .arg(board_arg())
                .arg(
                    Arg::with_name("PARTITION")
                        .help("partition number")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("PATH")
                        .help("directory inside the partition")
                        .required(true)
                        .index(3),
                )
                .arg(
                    Arg::with_name("COMMAND")
                        .help("shell command run in the local copy of the directory")
                        .required(true)
                        .index(4),
                ),
        )
        .subcommand(
            SubCommand::with_name("boot")
                .about("boot a board from its test partitions")
                .arg(board_arg()),
        )
        .subcommand(
            SubCommand::with_name("power")
                .about("power a board on or off, or reset it")
                .arg(board_arg())
                .arg(
                    Arg::with_name("ACTION")
                        .required(true)
                        .possible_values(&["on", "off", "reset"])
                        .index(2),
                ),
        )
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'bootmaster -v -v -v' or 'bootmaster -vvv' vs 'bootmaster -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        log_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("Failed to initialize the logger!");

    trace!("{:#?}", matches);

    let exit_code = match run(&matches) {
        Ok(()) => 0,
        Err(e) => {
            report(&e);
            if e.is_critical() {
                2
            } else {
                1
            }
        }
    };
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

fn run(matches: &ArgMatches) -> bm::Result<()> {
    // Has a default value.
    let config_path = matches.value_of("CONFIG").unwrap_or_default();
    let config = bm::Config::load(config_path)?;

    match matches.subcommand() {
        ("deploy", Some(sub)) => {
            let board = board(&config, sub)?;
            let request = DeployRequest {
                hwpack: sub.value_of("HWPACK").unwrap_or_default().to_owned(),
                rootfs: sub.value_of("ROOTFS").unwrap_or_default().to_owned(),
                kernel: sub.value_of("KERNEL").map(|url| KernelOverride {
                    url: url.to_owned(),
                    package_prefix: sub.value_of("KERNEL_PREFIX").unwrap_or_default().to_owned(),
                }),
                use_cache: !sub.is_present("NO_CACHE"),
            };
            if !sub.is_present("YES") && !confirm_format(&board)? {
                println!("[BM] {}", style("aborted").yellow());
                return Ok(());
            }

            let mut target = Target::connect(board, config.settings.clone())?;
            let deployed = bm::deploy(&mut target, &request)?;
            println!("[BM] {} {}", style("deployed").green(), target.board().hostname);
            if let Some(boot_url) = &deployed.boot_url {
                println!("     boot: {}", style(boot_url).cyan());
            }
            println!("     root: {}", style(&deployed.root_url).cyan());

            if sub.is_present("BOOT") {
                target.boot_test_image()?;
                println!("[BM] {} {}", style("booting").green(), target.board().hostname);
            }
            Ok(())
        }
        ("fs", Some(sub)) => {
            let board = board(&config, sub)?;
            let partition = value_t!(sub.value_of("PARTITION"), u32).unwrap_or_else(|e| e.exit());
            let path = sub.value_of("PATH").unwrap_or_default();
            let command = sub.value_of("COMMAND").unwrap_or_default();

            let mut target = Target::connect(board, config.settings.clone())?;
            bm::file_system(&mut target, partition, path, |dir| run_in(dir, command))?;
            println!("[BM] {} {}", style("updated").green(), path);
            Ok(())
        }
        ("boot", Some(sub)) => {
            let board = board(&config, sub)?;
            let mut controller = power::controller(&board.power, Arc::new(SystemShell));
            power::boot_from_disk(controller.as_mut())?;
            println!("[BM] {} {}", style("booting").green(), board.hostname);
            Ok(())
        }
        ("power", Some(sub)) => {
            let board = board(&config, sub)?;
            let mut controller = power::controller(&board.power, Arc::new(SystemShell));
            match sub.value_of("ACTION") {
                Some("on") => controller.power_on()?,
                Some("off") => controller.power_off()?,
                Some("reset") => controller.reset()?,
                _ => unreachable!(),
            }
            println!("[BM] {} {}", style("done").green(), board.hostname);
            Ok(())
        }
        _ => unreachable!(),
    }
}

fn board(config: &bm::Config, matches: &ArgMatches) -> bm::Result<Board> {
    config
        .board(matches.value_of("BOARD").unwrap_or_default())
        .map(Clone::clone)
}

fn confirm_format(board: &Board) -> bm::Result<bool> {
    Confirm::new()
        .with_prompt(format!(
            "[BM] The test partitions of {} will be formatted, continue?",
            style(&board.hostname).cyan()
        ))
        .default(false)
        .interact()
        .map_err(|e| bm::Error::Runtime(e.to_string()))
}

/// Run `command` through the shell with `dir` as working directory.
fn run_in(dir: &Path, command: &str) -> bm::Result<()> {
    println!("[BM] running {} in {}", style(command).cyan(), dir.display());
    let status = Command::new("sh").arg("-c").arg(command).current_dir(dir).status()?;
    if !status.success() {
        return Err(bm::Error::OperationFailed(format!(
            "`{}` exited with {}",
            command, status
        )));
    }
    Ok(())
}

fn report(e: &bm::Error) {
    let severity = if e.is_critical() {
        style("critical").red().bold()
    } else {
        style("error").red()
    };
    println!("[BM] {}: {}", severity, e);
    let mut source = StdError::source(e);
    while let Some(cause) = source {
        println!("   {} {}", style("-->").cyan(), cause);
        source = cause.source();
    }
}
