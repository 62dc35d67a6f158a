use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "whet",
    about = "TCP tunnels over WebRTC data channels with HTTP signaling",
    version
)]
pub struct Cli {
    /// Run the signaling server instead of the tunnel client
    #[arg(long)]
    pub serve: bool,

    /// Bind address in serve mode, signaling server address in client mode
    #[arg(long, default_value = "localhost:8080")]
    pub server: String,

    /// Bearer token required on signaling requests
    #[arg(long)]
    pub token: Option<String>,

    /// Generate a bearer token, print it, and use it
    #[arg(long)]
    pub gentoken: bool,

    /// Accepted for compatibility; data channels always run detached
    #[arg(long)]
    pub detached: bool,

    /// Local listener spec `name[-offset]=host:port` (repeatable)
    #[arg(long = "tcplisten", value_name = "SPEC")]
    pub tcplisten: Vec<String>,

    /// Server-side forward target `name=host:port[-range]` (repeatable)
    #[arg(long = "tcptarget", value_name = "SPEC")]
    pub tcptarget: Vec<String>,

    /// Static mount `subdomain=/path` served next to the signaling routes
    /// (repeatable)
    #[arg(long = "servefolder", value_name = "SPEC")]
    pub servefolder: Vec<String>,

    /// Reverse-proxy mount `subdomain=addr:port` (repeatable)
    #[arg(long = "proxytarget", value_name = "SPEC")]
    pub proxytarget: Vec<String>,

    /// Run the length-prefixed mirror server on the given address
    #[arg(long, value_name = "ADDR")]
    pub mirror: Option<String>,
}
