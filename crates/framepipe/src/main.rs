mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "framepipe", version, about = "Sandboxed frame renderer and channel tools")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "text",
        env = "FRAMEPIPE_LOG_FORMAT",
        global = true
    )]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "FRAMEPIPE_LOG_LEVEL",
        global = true
    )]
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
    fn parses_render_subcommand() {
        let cli = Cli::try_parse_from([
            "framepipe",
            "render",
            "--width",
            "540",
            "--height",
            "960",
            "--frames",
            "3",
            "--resize",
            "270x480",
        ])
        .expect("render args should parse");

        let Command::Render(args) = cli.command else {
            panic!("expected render");
        };
        assert_eq!(args.frames, 3);
        assert_eq!(args.resize.as_deref(), Some("270x480"));
    }

    #[test]
    fn rejects_named_and_anonymous_channel() {
        let err = Cli::try_parse_from([
            "framepipe",
            "render",
            "--channel",
            "/fp-demo",
            "--anonymous",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_watch_with_global_format() {
        let cli = Cli::try_parse_from([
            "framepipe",
            "watch",
            "/fp-demo",
            "--count",
            "2",
            "--format",
            "json",
        ])
        .expect("watch args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Watch(_)));
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = Cli::try_parse_from(["framepipe", "render", "--backend", "vulkan"])
            .expect_err("unknown backend should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn worker_subcommand_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["framepipe", "worker", "--no-sandbox"])
            .expect("worker args should parse");
        assert!(matches!(cli.command, Command::Worker(ref args) if args.no_sandbox));
    }
}
