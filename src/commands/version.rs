pub fn run() -> anyhow::Result<()> {
    println!("codepod {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
