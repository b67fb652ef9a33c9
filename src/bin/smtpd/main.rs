//! `smtpd-maildir <config.toml>`
//!
//! Loads configuration, forks the master/worker/logger process
//! topology, and runs until `SIGTERM`/`SIGINT`. Exits 1 on a
//! configuration error, 2 if the listening socket cannot be bound.

use std::process::ExitCode;

use smtpd_maildir::{master, settings::Settings, signals};

fn main() -> ExitCode {
    let mut args = std::env::args_os().skip(1);
    let config_path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("usage: smtpd-maildir <config.toml>");
            return ExitCode::from(1);
        }
    };

    let settings = match Settings::load_sync(&config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("smtpd-maildir: {}", e);
            return ExitCode::from(1);
        }
    };

    signals::ignore_sigpipe_and_sighup();

    match master::run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("smtpd-maildir: {}", e);
            ExitCode::from(2)
        }
    }
}
