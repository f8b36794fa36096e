use crate::cli::ConfigArgs;
use fusion_recorder::recorder::RecordingConfig;
use fusion_recorder::utils::AppResult;

/// Print the default configuration, or the validated contents of `--check`
pub fn execute(args: ConfigArgs) -> AppResult<()> {
    let config = match &args.check {
        Some(path) => {
            let config = RecordingConfig::load(path)?;
            tracing::info!("Configuration {:?} is valid", path);
            config
        }
        None => RecordingConfig::default(),
    };
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
