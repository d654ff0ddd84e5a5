use clap::Parser;

#[derive(Parser, Clone)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help = "Enable verbose logging (-v for debug, -vv for trace)"
    )]
    pub verbose: u8,

    /// Address to serve the API on
    #[arg(
        long = "host",
        value_name = "IP:PORT",
        default_value = "localhost:5000",
        help = "Bind address for the HTTP server"
    )]
    pub host: String,

    /// Directory holding the model registry and settings
    #[arg(
        short = 'd',
        long = "dir",
        value_name = "DATA_DIR",
        default_value = "~/.llm_host",
        help = "Data directory (~ is expanded)"
    )]
    pub data_dir: String,
}
