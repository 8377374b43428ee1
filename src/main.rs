use anyhow::Result;
use dimr::app;
use dimr::cli;

fn main() -> Result<()> {
    let invocation = cli::parse()?;
    app::init_logging(invocation.verbose);
    let exit_code = app::run(invocation.command)?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
