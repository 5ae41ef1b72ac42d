use log::{info, warn};
use tokio::process::Command;

use crate::config::Settings;
use crate::error::{Error, Result};

/// How much of dbt's stderr is kept in the error.
const STDERR_TAIL_CHARS: usize = 2000;

/// Run `dbt build` against the project directory. The warehouse models are
/// owned by dbt; this only invokes it and reports the outcome.
pub async fn run_dbt(settings: &Settings) -> Result<String> {
    info!(
        "Running {} build in {}",
        settings.dbt_bin,
        settings.dbt_project_dir.display()
    );
    let output = Command::new(&settings.dbt_bin)
        .arg("build")
        .arg("--project-dir")
        .arg(&settings.dbt_project_dir)
        .output()
        .await
        .map_err(|e| Error::io(&settings.dbt_bin, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        info!("dbt: {}", line);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("dbt exited with {}", output.status);
        return Err(Error::Transform {
            code: output.status.code(),
            stderr: tail(&stderr, STDERR_TAIL_CHARS),
        });
    }

    Ok(stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("dbt build finished")
        .trim()
        .to_string())
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_dbt(bin: &str) -> Settings {
        Settings::from_lookup(|key| match key {
            "DBT_BIN" => Some(bin.to_string()),
            "DBT_PROJECT_DIR" => Some(".".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_transform_error() {
        // `false` ignores its arguments and exits 1
        let err = run_dbt(&settings_with_dbt("false")).await.unwrap_err();
        assert!(matches!(err, Error::Transform { code: Some(1), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_reports_last_output_line() {
        let summary = run_dbt(&settings_with_dbt("echo")).await.unwrap();
        assert_eq!(summary, "build --project-dir .");
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let err = run_dbt(&settings_with_dbt("definitely-not-a-dbt-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
