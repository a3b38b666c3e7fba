//! intervald entry point.

use interval_accumulator::cli::{self, Cli};
use interval_accumulator::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let cli = Cli::parse_args();

    // Execute the command
    cli::execute(cli).await
}
