use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about = "Node-local IP address management", long_about = None)]
pub(crate) struct Cmd {
    #[arg(short = 'f', long, global = true, help = "Config file path")]
    pub file: Option<String>,

    #[arg(
        value_enum,
        short = 'o',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Output format"
    )]
    pub output: Output,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum SubCmd {
    /// Allocate an address for a container
    Allocate {
        #[arg(short, long, help = "Network name")]
        network: String,
        #[arg(short, long = "container-id")]
        container_id: String,
        #[arg(short, long = "if-name", default_value = "eth0")]
        if_name: String,
        #[arg(long, help = "CNI_ARGS style pod arguments")]
        args: Option<String>,
    },
    /// Release the addresses of a container
    Release {
        #[arg(short, long, help = "Network name")]
        network: String,
        #[arg(short, long = "container-id")]
        container_id: String,
        #[arg(short, long = "if-name", default_value = "eth0")]
        if_name: String,
        #[arg(long, help = "CNI_ARGS style pod arguments")]
        args: Option<String>,
    },
    /// List allocated addresses of a range network
    List {
        #[arg(short, long, help = "Network name")]
        network: String,
    },
    /// Purge tombstones older than the configured grace period
    Gc,
    /// Run the garbage collector until interrupted
    Run,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub(crate) enum Output {
    Plain,
    Json,
}
