//! Command line options

use clap::Parser;
use clio::Input;

#[derive(Debug, Parser)]
#[command(name = "booking-server", about = "Class-booking marketplace REST service")]
pub struct Opt {
    /// Config file path
    #[arg(short, long, value_parser, default_value = "config.toml")]
    pub config: Input,
}
