// Binary entry point for fnexec
// This is a thin wrapper that delegates to the library implementation

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = fnexec::cli::run().await {
        eprintln!("fnexec fatal error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
