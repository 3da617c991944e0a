use clap::Parser;
use ibisd::Cli;
use ibisd::Config;
use ibisd::Ibisd;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from(cli);
    let daemon = Ibisd::from_config(config);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        daemon.start().await;

        // Run until ctrl-c, then shut down cleanly: the node finishes any
        // in-progress flush before the process may exit
        tokio::signal::ctrl_c().await?;
        daemon.stop().await;
        daemon.wait_shutdown().await;

        anyhow::Ok(())
    })
}
