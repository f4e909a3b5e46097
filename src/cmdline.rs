//! Kernel command-line parsing.
//!
//! Options are `-o <name>` pairs; everything after `--` is the
//! command line of the initial user process.

use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BootOptions {
    /// Use the multilevel-feedback-queue scheduler instead of the
    /// priority scheduler.
    pub mlfqs: bool,
    /// Initial user command to run, if any.
    pub run: Option<String>,
}

pub fn parse(cmdline: &str) -> BootOptions {
    let mut options = BootOptions::default();
    let mut tokens = cmdline.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "--" => {
                let rest: Vec<&str> = tokens.collect();
                if !rest.is_empty() {
                    options.run = Some(rest.join(" "));
                }
                break;
            }
            "-o" => match tokens.next() {
                Some("mlfqs") => options.mlfqs = true,
                Some(other) => {
                    crate::log_warn!("cmdline: unknown option '{}'", other);
                }
                None => {}
            },
            other => {
                crate::log_warn!("cmdline: ignoring '{}'", other);
            }
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_gives_defaults() {
        let options = parse("");
        assert!(!options.mlfqs);
        assert_eq!(options.run, None);
    }

    #[test]
    fn mlfqs_flag() {
        assert!(parse("-o mlfqs").mlfqs);
        assert!(!parse("-o other").mlfqs);
    }

    #[test]
    fn run_command_after_separator() {
        let options = parse("-o mlfqs -- echo hello world");
        assert!(options.mlfqs);
        assert_eq!(options.run.as_deref(), Some("echo hello world"));
    }

    #[test]
    fn separator_alone_means_no_command() {
        assert_eq!(parse("--").run, None);
        assert_eq!(parse("-- prog").run.as_deref(), Some("prog"));
    }

    #[test]
    fn options_after_separator_are_arguments() {
        let options = parse("-- prog -o mlfqs");
        assert!(!options.mlfqs);
        assert_eq!(options.run.as_deref(), Some("prog -o mlfqs"));
    }
}
