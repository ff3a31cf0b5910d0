use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// Directory of the leader and window sockets
    #[clap(long = "runtime-dir", env = "WINDOWD_RUNTIME_DIR", default_value = "/tmp")]
    pub runtime_dir: PathBuf,

    /// Only processes with the same app name elect a common leader
    #[clap(long = "app-name", default_value = "windowd")]
    pub app_name: String,

    /// Name of the window this process might create
    #[clap(long = "name")]
    pub name: Option<String>,

    /// How often to check if the leader is still alive, e.g. `100ms`, `2s`
    #[clap(long = "liveness-poll", value_parser = parse_duration)]
    pub liveness_poll: Option<Duration>,

    /// Commandline to route to a window
    #[clap(last = true)]
    pub commandline: Vec<String>,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

/// Milliseconds by default, `ms` and `s` suffixes accepted
fn parse_duration(s: &str) -> std::result::Result<Duration, ParseIntError> {
    let s = s.trim().to_lowercase();

    Ok(if let Some(num) = s.strip_suffix("ms") {
        Duration::from_millis(u64::from_str(num)?)
    } else if let Some(num) = s.strip_suffix('s') {
        Duration::from_secs(u64::from_str(num)?)
    } else {
        Duration::from_millis(u64::from_str(&s)?)
    })
}

#[test]
fn parse_duration_test() {
    assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
    assert_eq!(parse_duration("250"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
    assert_eq!(parse_duration(" 2S "), Ok(Duration::from_secs(2)));
    assert!(parse_duration("s").is_err());
    assert!(parse_duration("ms").is_err());
    assert!(parse_duration("1m").is_err());
}

#[test]
fn commandline_after_double_dash() {
    let opts = Opts::parse_from(["windowd", "--name", "main", "--", "-w", "last", "file"]);
    assert_eq!(opts.name.as_deref(), Some("main"));
    assert_eq!(opts.commandline, vec!["-w", "last", "file"]);
}
