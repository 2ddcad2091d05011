use std::path::Path;

use nodepool::ClientSettings;

pub fn check(path: &Path) -> anyhow::Result<()> {
    let settings = ClientSettings::load(path)?;
    tracing::info!(
        path = %path.display(),
        nodes = settings.nodes.len(),
        mode = %settings.policy.mode,
        "config is valid"
    );
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
