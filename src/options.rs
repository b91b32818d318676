use clap::Parser;

/// Envertech Bridge - local polling for Envertech micro-inverters
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    /// Broadcast for devices on the local network, print them and exit
    #[clap(long = "discover")]
    pub discover: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
