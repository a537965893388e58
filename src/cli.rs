//! # Command-Line Interface Module
//!
//! Argument parsing for the `dbus-transport-harness` debug binary: a thin client/server
//! driver over [`crate::transport::Transport`], used to exercise the transport end to
//! end without a full bus daemon.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Which role this invocation of the harness plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Open a listening backend and wait for one connection.
    Server,
    /// Connect to an address a server already has open.
    Client,
}

/// A small debug client/server for the D-Bus-style transport layer.
///
/// Exercises the SASL `EXTERNAL` handshake and message dispatch over a real backend
/// (`unix:path=...`, `tcp:host=...,port=...`) without requiring a full bus daemon.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Whether this invocation listens for a connection or dials out to one
    #[arg(value_enum)]
    pub mode: Mode,

    /// Transport address, e.g. `unix:path=/tmp/bus.sock` or `tcp:host=127.0.0.1,port=7700`
    #[arg(short = 'a', long)]
    pub address: String,

    /// Pin the server's guid on the client side; rejected if the server presents a
    /// different one. Servers generate their own guid if unset.
    #[arg(long)]
    pub guid: Option<String>,

    /// Silence all user-facing informational output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and more: trace
    /// By default, only INFO and above are shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Write detailed logs to this file instead of a daily-rotated default, or to
    /// stderr if the literal value "stderr" is given
    #[arg(long)]
    pub log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }
}
