//! Default routing policy: `-w`/`--window` picks the target window
//!
//! * `new`, or no flag at all: a new window
//! * `last` or `0`: the most recently activated window
//! * a number: the window with that id
use windowd_api::{CommandlineArgs, PeasantId};

use crate::monarch::{FindTargetWindowArgs, WindowTarget};

pub fn window_target_from_args(args: &CommandlineArgs) -> WindowTarget {
    let mut iter = args.args().iter();
    while let Some(arg) = iter.next() {
        let value = if arg == "-w" || arg == "--window" {
            iter.next().map(String::as_str)
        } else if let Some(value) = arg.strip_prefix("--window=") {
            Some(value)
        } else {
            continue;
        };

        return match value {
            Some("last") => WindowTarget::MostRecent,
            Some(value) => match value.parse::<u64>() {
                Ok(0) => WindowTarget::MostRecent,
                Ok(id) => WindowTarget::Id(PeasantId(id)),
                Err(_) => WindowTarget::New,
            },
            None => WindowTarget::New,
        };
    }
    WindowTarget::New
}

/// Subscriber for `FindTargetWindowRequested` applying [`window_target_from_args`]
pub fn route_by_window_flag(event: &FindTargetWindowArgs) {
    event.set_result_target_window(window_target_from_args(event.args()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(args: &[&str]) -> WindowTarget {
        window_target_from_args(&CommandlineArgs::new(
            args.iter().map(|s| s.to_string()).collect(),
            "/",
        ))
    }

    #[test]
    fn window_flag_selects_target() {
        assert_eq!(target(&[]), WindowTarget::New);
        assert_eq!(target(&["open", "file.txt"]), WindowTarget::New);
        assert_eq!(target(&["-w", "new"]), WindowTarget::New);
        assert_eq!(target(&["-w", "last"]), WindowTarget::MostRecent);
        assert_eq!(target(&["-w", "0"]), WindowTarget::MostRecent);
        assert_eq!(target(&["--window", "3"]), WindowTarget::Id(PeasantId(3)));
        assert_eq!(target(&["--window=7", "x"]), WindowTarget::Id(PeasantId(7)));
        assert_eq!(target(&["x", "-w"]), WindowTarget::New);
        assert_eq!(target(&["-w", "bogus"]), WindowTarget::New);
    }

    #[test]
    fn subscriber_sets_result() {
        let event = FindTargetWindowArgs::new(CommandlineArgs::new(
            vec!["-w".into(), "last".into()],
            "/",
        ));
        assert_eq!(event.result_target_window(), None);
        route_by_window_flag(&event);
        assert_eq!(event.result_target_window(), Some(WindowTarget::MostRecent));
    }
}
