// [AMBIENT] Configuration (SPEC_FULL.md §2; original_source/src/server/ocland.c's
// parseOptions/getopt_long table).
use std::path::PathBuf;

/// Assembled once at startup from `std::env::args` (SPEC_FULL.md §2's
/// "[AMBIENT] Configuration"): no env-var surface, matching the original
/// server's CLI-only configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_port: u16,
    pub log_file: Option<PathBuf>,
    /// Accepted connections beyond this are refused at the listener
    /// (original's `MAX_CLIENTS`, default 32).
    pub max_clients: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_port: oclproxy_common::DEFAULT_BASE_PORT,
            log_file: None,
            max_clients: 32,
        }
    }
}

/// What `parse_args` decided to do, short of running the server.
pub enum ParsedArgs {
    Run(Config),
    ShowHelp,
    ShowVersion,
}

const USAGE: &str = "\
Usage: oclproxyd [OPTION]...
Launch the oclproxy server.

  -l, --log-file=LOG   Output log file. Stderr is used if unset.
  -p, --port=PORT       Base TCP port (command channel); callbacks use PORT+1.
  -v, --version         Show name and version
  -h, --help            Show this help page
";

/// `original_source/src/server/ocland.c`'s `parseOptions`, reworked as a
/// pure function over `std::env::args` rather than the getopt-style
/// global-exit pattern, so it is testable without a process boundary.
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut config = Config::default();
    let mut iter = args.into_iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-l" | "--log-file" => {
                let value = iter.next().ok_or("--log-file requires an argument")?;
                config.log_file = Some(PathBuf::from(value));
            }
            "-p" | "--port" => {
                let value = iter.next().ok_or("--port requires an argument")?;
                config.base_port = value.parse().map_err(|_| format!("invalid port: {value}"))?;
            }
            "-v" | "--version" => return Ok(ParsedArgs::ShowVersion),
            "-h" | "--help" => return Ok(ParsedArgs::ShowHelp),
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }
    Ok(ParsedArgs::Run(config))
}

pub fn usage() -> &'static str {
    USAGE
}

pub fn version_string() -> String {
    format!("oclproxyd {}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_standard_base_port_and_max_clients() {
        let config = Config::default();
        assert_eq!(config.base_port, 51000);
        assert_eq!(config.max_clients, 32);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn parses_log_file_and_port() {
        let parsed = parse_args(
            ["--log-file", "/tmp/oclproxy.log", "--port", "52000"]
                .into_iter()
                .map(String::from),
        )
        .unwrap();
        match parsed {
            ParsedArgs::Run(config) => {
                assert_eq!(config.log_file, Some(PathBuf::from("/tmp/oclproxy.log")));
                assert_eq!(config.base_port, 52000);
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn version_and_help_short_circuit() {
        assert!(matches!(
            parse_args(["-v".to_string()]).unwrap(),
            ParsedArgs::ShowVersion
        ));
        assert!(matches!(
            parse_args(["-h".to_string()]).unwrap(),
            ParsedArgs::ShowHelp
        ));
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(parse_args(["--bogus".to_string()]).is_err());
    }
}
