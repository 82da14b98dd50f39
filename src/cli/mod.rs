pub mod commands;

use clap::{Arg, ArgAction, ArgMatches, Command};

pub use commands::handle_subcommands;

pub fn build_cli() -> Command {
    Command::new("rtu_link")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Modbus RTU-over-TCP client for instrument controllers")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .short('H')
                .value_name("HOST")
                .help("Controller address (default 192.168.4.1)"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .value_name("PORT")
                .help("TCP port (default 503)"),
        )
        .arg(
            Arg::new("unit")
                .long("unit")
                .short('u')
                .value_name("ID")
                .help("Modbus unit id, 1-247"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .short('i')
                .value_name("MS")
                .help("Poll interval in milliseconds"),
        )
        .arg(
            Arg::new("max-chunk")
                .long("max-chunk")
                .value_name("REGISTERS")
                .help("Largest read sent to the device in one request"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .short('f')
                .value_parser(["console", "json"])
                .help("Output format"),
        )
        .subcommand(Command::new("run").about("Connect, poll and print value changes until Ctrl-C"))
        .subcommand(
            Command::new("read")
                .about("Read registers once")
                .arg(Arg::new("address").required(true).help("First register address"))
                .arg(
                    Arg::new("count")
                        .long("count")
                        .short('n')
                        .value_name("N")
                        .help("Number of registers"),
                )
                .arg(
                    Arg::new("holding")
                        .long("holding")
                        .help("Read holding registers instead of input registers")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("write")
                .about("Write one holding register")
                .arg(Arg::new("address").required(true))
                .arg(Arg::new("value").required(true)),
        )
        .subcommand(
            Command::new("config").about("Write the effective configuration").arg(
                Arg::new("output")
                    .long("output")
                    .short('o')
                    .value_name("FILE")
                    .help("Destination (default rtu_link.toml)"),
            ),
        )
}

pub fn parse_args() -> ArgMatches {
    build_cli().get_matches()
}
