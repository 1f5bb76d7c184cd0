use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "HOMEFEED_LOG";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if handle_cli_flags(&args) {
        return;
    }

    init_logging();

    let input = match parse_replay_args(&args) {
        Ok(input) => input,
        Err(message) => {
            eprintln!("error: {message}\n\n{}", usage());
            std::process::exit(2);
        }
    };

    if let Err(err) = homefeed::run(input) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .init();
}

fn usage() -> String {
    format!(
        "homefeed {} - replay feed sessions against the media cache, dwell tracker and comment store.\n\nUsage:\n  homefeed replay [FILE]   Read JSON-lines commands from FILE (or stdin)\n  --version, -V            Show version and exit\n  --help,    -h            Show this help message\n\nLogging is controlled by {LOG_ENV} (default: warn).",
        homefeed::VERSION
    )
}

fn handle_cli_flags(args: &[String]) -> bool {
    let mut saw_flag = false;
    for arg in args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("homefeed {}", homefeed::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{}", usage());
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}

fn parse_replay_args(args: &[String]) -> Result<Option<PathBuf>, String> {
    match args {
        [] => Err("missing command".to_string()),
        [cmd, rest @ ..] if cmd == "replay" => match rest {
            [] => Ok(None),
            [path] if path == "-" => Ok(None),
            [path] => Ok(Some(PathBuf::from(path))),
            _ => Err("replay takes at most one file".to_string()),
        },
        [other, ..] => Err(format!("unknown command {other:?}")),
    }
}
