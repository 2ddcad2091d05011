use std::path::Path;

use nodepool_core::NodepoolConfig;

pub fn init(address: &str, output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = NodepoolConfig::scaffold(address);
    std::fs::write(output, config.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
