//! Init command - create project-local .forgecache.toml

use crate::cli::args::InitArgs;
use crate::config::LOCAL_CONFIG_NAME;
use crate::error::{ForgeError, ForgeResult};
use console::style;
use tokio::fs;

/// Template for project-local config
const INIT_TEMPLATE: &str = r#"# forgecache project configuration
# Settings here override your global config (~/.config/forgecache/config.toml)

[cache]
# dir = ".forge_cache"
# artifact_ext = "step"
# stale_lock_secs = 1800

[export]
# kernel_bin = "openscad"
# kernel_args = ["--export-format", "step"]
# timeout_secs = 600
# max_workers = 4
# validate_output = true

[canonicalize]
# bin = "openscad"
# search_path = "third_party"
"#;

/// Execute the init command
pub async fn execute(args: InitArgs) -> ForgeResult<()> {
    let target_dir = match args.path {
        Some(ref p) => p.clone(),
        None => {
            std::env::current_dir().map_err(|e| ForgeError::io("getting current directory", e))?
        }
    };

    let config_path = target_dir.join(LOCAL_CONFIG_NAME);

    if config_path.exists() && !args.force {
        return Err(ForgeError::User(format!(
            "{} already exists. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if !target_dir.exists() {
        fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| ForgeError::io(format!("creating directory {}", target_dir.display()), e))?;
    }

    fs::write(&config_path, INIT_TEMPLATE)
        .await
        .map_err(|e| ForgeError::io(format!("writing {}", config_path.display()), e))?;

    println!(
        "{} Created project config ({})",
        style("[OK]").green(),
        config_path.display()
    );

    Ok(())
}
