mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "busprims", version, about = "Handler and prober link CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "busprims",
            "send",
            "tcp/localhost/5000",
            "--data",
            "FA?",
            "--wait",
        ])
        .expect("send args should parse");

        assert!(matches!(cli.command, Command::Send(_)));
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "busprims",
            "send",
            "tcp/localhost/5000",
            "--data",
            "FA?",
            "--file",
            "/tmp/msg.txt",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_link_mode() {
        let cli = Cli::try_parse_from([
            "busprims",
            "receive",
            "rs232/dev/ttyS0",
            "--mode",
            "offline",
            "--timeout",
            "500ms",
        ])
        .expect("receive args should parse");

        match cli.command {
            Command::Receive(args) => {
                assert_eq!(args.link.mode, Some(busprims_link::LinkMode::Offline));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_link_mode() {
        let err = Cli::try_parse_from(["busprims", "receive", "tcp/h/1", "--mode", "bogus"])
            .expect_err("unknown mode should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_serve_subcommand() {
        let cli = Cli::try_parse_from(["busprims", "serve", "--port", "5005", "--echo"])
            .expect("serve args should parse");
        assert!(matches!(cli.command, Command::Serve(_)));
    }
}
