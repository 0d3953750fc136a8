#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = examflow::run_worker().await {
        eprintln!("examflow-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
