//! PHP specifics: release catalog lookup, mirror expansion, binary
//! verification and `php.ini` rendering.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Archive file name for a short version such as `8.3`
pub fn archive_name<'a>(releases: &'a BTreeMap<String, String>, version: &str) -> Option<&'a str> {
    releases.get(version).map(String::as_str)
}

/// Expand `{file}` in every mirror template, keeping mirror order
pub fn mirror_urls(templates: &[String], file: &str) -> Vec<String> {
    templates
        .iter()
        .map(|template| template.replace("{file}", file))
        .collect()
}

/// Outcome of running `<php> -v`
#[derive(Debug)]
pub enum Verification {
    /// First line of the version banner
    Valid(String),
    /// Ran, but did not identify itself as PHP
    Unexpected(String),
}

/// Run `<executable> -v` and check that it reports itself as PHP.
///
/// A non-zero exit is tolerated when stdout still carries the banner; some
/// builds complain about missing extensions while otherwise working.
pub async fn verify_interpreter(executable: &Path) -> io::Result<Verification> {
    let output = Command::new(executable).arg("-v").output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    debug!(
        executable = %executable.display(),
        status = ?output.status.code(),
        "Interpreter version probe finished"
    );

    if stdout.contains("PHP") {
        let banner = stdout.lines().next().unwrap_or_default().trim().to_string();
        return Ok(Verification::Valid(banner));
    }

    let detail = if output.status.success() {
        format!("unexpected output: {}", stdout.trim())
    } else {
        format!(
            "exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )
    };
    Ok(Verification::Unexpected(detail))
}

/// Settings rendered into the bundled `php.ini`
#[derive(Debug, Clone)]
pub struct PhpIni {
    pub max_execution_time: u32,
    pub memory_limit: String,
    pub upload_limit: String,
    pub extensions: Vec<String>,
}

impl Default for PhpIni {
    fn default() -> Self {
        Self {
            max_execution_time: 120,
            memory_limit: "256M".to_string(),
            upload_limit: "64M".to_string(),
            extensions: Vec::new(),
        }
    }
}

impl PhpIni {
    pub fn render(&self) -> String {
        let mut ini = String::from("[PHP]\n");
        ini.push_str("engine = On\n");
        ini.push_str("short_open_tag = On\n");
        ini.push_str(&format!("max_execution_time = {}\n", self.max_execution_time));
        ini.push_str(&format!("memory_limit = {}\n", self.memory_limit));
        ini.push_str(&format!("post_max_size = {}\n", self.upload_limit));
        ini.push_str(&format!("upload_max_filesize = {}\n", self.upload_limit));
        ini.push_str("display_errors = Off\n");
        ini.push_str("log_errors = On\n");
        ini.push_str("error_log = php_errors.log\n");
        ini.push_str("default_mimetype = \"text/html\"\n");
        ini.push_str("default_charset = \"UTF-8\"\n");
        ini.push_str("file_uploads = On\n");
        ini.push_str("allow_url_fopen = On\n");
        ini.push_str("cgi.force_redirect = 0\n");
        ini.push_str("enable_dl = Off\n");
        ini.push_str("extension_dir = \"ext\"\n");
        for ext in &self.extensions {
            ini.push_str(&format!("extension={}\n", extension_file(ext)));
        }
        ini
    }

    /// Write `php.ini` into `dir`, returning its path
    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join("php.ini");
        std::fs::write(&path, self.render())?;
        Ok(path)
    }
}

fn extension_file(name: &str) -> String {
    if cfg!(windows) {
        format!("php_{}.dll", name)
    } else {
        name.to_string()
    }
}
