use argh::FromArgs;

/// Run the patron API server.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// port to listen on (default 8080)
    #[argh(option, default = "8080")]
    pub port: u16,

    /// run database migrations before serving
    #[argh(switch)]
    pub migrate: bool,

    /// number of webhook worker tasks (default 4)
    #[argh(option, default = "4")]
    pub webhook_workers: usize,
}
