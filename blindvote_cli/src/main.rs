use clap::{App, AppSettings, Arg, SubCommand};
use tracing_subscriber::EnvFilter;

mod command_decode;
mod command_keygen;
mod command_payload;
mod command_verify;

use command_decode::command_decode;
use command_keygen::command_keygen;
use command_payload::command_payload;
use command_verify::command_verify;

fn main() {
    let matches = App::new("blindvote")
        .version("0.1")
        .author("Patrick Hayes <patrick.d.hayes@gmail.com>")
        .about("Voter-side tools for blind-signature voting")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("keygen")
                .about("Generate a voter key pair")
                .arg(
                    Arg::with_name("from-env")
                        .long("from-env")
                        .help("Print the public key of BLINDVOTE_SECRET_KEY instead"),
                ),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("Validate and inspect a protocol message")
                .arg(
                    Arg::with_name("JSON")
                        .index(1)
                        .required(true)
                        .help("Message JSON, or - to read stdin"),
                ),
        )
        .subcommand(
            SubCommand::with_name("payload")
                .about("Compose a vote payload")
                .arg(
                    Arg::with_name("hash")
                        .long("hash")
                        .takes_value(true)
                        .required(true)
                        .help("Nonce hash, base64"),
                )
                .arg(
                    Arg::with_name("token")
                        .long("token")
                        .takes_value(true)
                        .required(true)
                        .help("Unblinded signature, base64"),
                )
                .arg(
                    Arg::with_name("randomizer")
                        .long("randomizer")
                        .takes_value(true)
                        .required(true)
                        .help("Blinding randomizer, base64"),
                )
                .arg(
                    Arg::with_name("candidate")
                        .long("candidate")
                        .takes_value(true)
                        .required(true)
                        .help("Candidate id"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Verify a vote payload's token against an election")
                .arg(
                    Arg::with_name("PAYLOAD")
                        .index(1)
                        .required(true)
                        .help("Vote payload"),
                )
                .arg(
                    Arg::with_name("election")
                        .long("election")
                        .takes_value(true)
                        .required(true)
                        .help("Election event or election JSON file"),
                ),
        )
        .get_matches();

    init_logging(matches.occurrences_of("v"));

    let config = match blindvote::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("blindvote: {}", e);
            std::process::exit(1);
        }
    };
    tracing::debug!(
        voter = %hex::encode(config.public_key().as_bytes()),
        relays = ?config.relays,
        "configuration loaded"
    );

    // Subcommands
    match matches.subcommand() {
        ("keygen", Some(matches)) => command_keygen(matches, &config),
        ("decode", Some(matches)) => command_decode(matches),
        ("payload", Some(matches)) => command_payload(matches),
        ("verify", Some(matches)) => command_verify(matches),
        _ => {}
    }
}

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

pub fn expand(input: &str) -> String {
    shellexpand::tilde(input).into_owned()
}
