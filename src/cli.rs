use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Node endpoint: http(s)://, ws(s)://, or the path of an IPC socket
    #[arg(short, long, default_value = "ws://127.0.0.1:8546")]
    pub url: String,

    /// Method namespace, e.g. `eth` or `cfx`
    #[arg(short, long, default_value = "eth")]
    pub namespace: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Calls a method with a JSON array of params
    Call {
        method: String,
        #[arg(default_value = "[]")]
        params: String,
    },
    GetBalance {
        address: String,
        #[arg(short, long, default_value = "latest")]
        block: String,
    },
    /// Prints notifications of a subscription, e.g. `newHeads` or `logs`
    Subscribe {
        #[arg(default_value = "newHeads")]
        kind: String,
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
    /// Sends parameterless methods as one batch
    Batch {
        #[arg(required = true)]
        methods: Vec<String>,
    },
}
