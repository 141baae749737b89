use crate::config::{generate_starter_config, load_config, Settings};
use crate::sink::insert_statement;
use console::style;
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let content = generate_starter_config();
    if stdout {
        print!("{}", content);
        return Ok(());
    }

    let path = default_config_path();
    write_config(&content, &path)?;
    println!("Config file written to {}", style(path.display()).green());
    Ok(())
}

/// `~/.config/clicksink/config.yml`, or the system location without a home.
fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".config/clicksink/config.yml"))
        .unwrap_or_else(|| PathBuf::from("/etc/clicksink/config.yml"))
}

fn write_config(content: &str, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            path.display()
        )
        .into());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Validate a config file and print what the pipeline would do with it.
pub fn check(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;
    println!("Validating config file: {}", path.display());

    let settings = match load_config(&path).and_then(Settings::from_config) {
        Ok(settings) => settings,
        Err(e) => {
            println!("{}", style("✗ Config validation failed").red());
            return Err(e.into());
        }
    };

    println!("{}", style("✓ Config is valid").green());
    println!("  brokers:   {}", settings.brokers);
    println!("  topics:    {}", settings.topics.join(", "));
    println!("  sink:      {}", settings.sink_description());
    println!(
        "  statement: {}",
        insert_statement(&settings.table, &settings.columns)
    );
    println!(
        "  batch:     {} records or {}",
        settings.batch.size,
        humantime_serde::re::humantime::format_duration(settings.batch.timeout)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_config_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yml");

        write_config("a: 1\n", &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a: 1\n");

        let err = write_config("a: 2\n", &path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "a: 1\n");
    }
}
