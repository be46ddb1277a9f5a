use anyhow::Result;

mod api;
mod browser;
mod cli;
mod storage;
mod utils;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments; each command sets up its own logging
    let args = cli::parse_args();

    match cli::process_command(args).await {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("Command failed: {e:#}");
            Err(e)
        }
    }
}
