use anyhow::Result;
use clap::Parser;

use clusterleader::{App, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut app = App::new(cli)?;
    app.run().await
}
