use log::*;

use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches};
use nix::unistd::Pid;

use tagtrace::trace::{self, Target, TraceOptions};

fn pid_arg(index: usize) -> Arg<'static> {
    Arg::new("pid")
        .help("Pid of the process to trace")
        .required(true)
        .index(index)
}

fn command_args(index: usize) -> Arg<'static> {
    Arg::new("command")
        .help("Program and arguments to run under the tracer")
        .multiple_occurrences(true)
        .required(true)
        .index(index)
}

fn threads_arg() -> Arg<'static> {
    Arg::new("threads")
        .long("threads")
        .takes_value(true)
        .default_value("16")
        .help("Number of thread contexts to reserve up front")
}

fn taint_fd_arg() -> Arg<'static> {
    Arg::new("taint-fd")
        .long("taint-fd")
        .takes_value(true)
        .multiple_occurrences(true)
        .value_name("FD")
        .help("Taint data read from this file descriptor (may be repeated)")
}

fn run_trace(args: &ArgMatches, target: Target) {
    let taint_fds = if args.is_present("taint-fd") {
        args.values_of_t("taint-fd").unwrap_or_else(|e| e.exit())
    } else {
        vec![]
    };
    let opts = TraceOptions {
        target,
        expected_threads: args.value_of_t_or_exit("threads"),
        taint_fds,
    };

    match trace::trace(&opts) {
        Ok(Some(code)) => std::process::exit(code),
        Ok(None) => {}
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    }
}

fn run(args: &ArgMatches) {
    let command = args.values_of_t("command").unwrap_or_else(|e| e.exit());
    run_trace(args, Target::Command(command));
}

fn attach(args: &ArgMatches) {
    let pid = Pid::from_raw(args.value_of_t_or_exit("pid"));
    run_trace(args, Target::Pid(pid));
}

fn setup_logging(matches: &clap::ArgMatches) {
    if matches.is_present("verbose") {
        env_logger::Builder::new().parse_filters("debug").init();
        return;
    }

    if let Some(level) = matches.value_of("loglevel") {
        env_logger::Builder::new().parse_filters(level).init();
        return;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() {
    let run_command = App::new("run")
        .about("Run a program with taint tags tracked across its syscalls.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::TrailingVarArg)
        .arg(threads_arg())
        .arg(taint_fd_arg())
        .arg(command_args(1));

    let attach_command = App::new("attach")
        .about("Attach to all threads of a running process.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(threads_arg())
        .arg(taint_fd_arg())
        .arg(pid_arg(1));

    let main_app = App::new("tagtrace")
        .about("Track taint tags of a process from the outside.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::new("verbose")
             .short('v')
             .conflicts_with("loglevel")
             .help("shorthand for --loglevel debug"))
        .arg(Arg::new("loglevel")
             .short('l')
             .takes_value(true)
             .help("Finegrained verbosity control. See docs.rs/env_logger. Examples: [error, warn, info, debug, trace]"))
        .subcommands([run_command, attach_command]);

    let matches = main_app.get_matches();
    setup_logging(&matches);
    match matches.subcommand() {
        Some(("run", sub_matches)) => run(sub_matches),
        Some(("attach", sub_matches)) => attach(sub_matches),
        Some((_, _)) => unreachable!(),
        None => unreachable!(),
    }
}
