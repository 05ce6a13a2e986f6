//! Phoenix CLI
//!
//! All CLI logic lives in the `cli` module. This file is just the entry point.

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A freshly staged build is being asked to prove it starts.
    phoenix::answer_bin_check();
    cli::run().await
}
