//! Callguard.
//!
//! Calls the endpoints declared in a configuration file through a shared response cache, so
//! repeated and concurrent calls of the same endpoint only reach the network once.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
