use server::cli::Args;

fn main() -> anyhow::Result<()> {
    logger::init();

    let args = argh::from_env::<Args>();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
        .block_on(server::run::run(args))
}
