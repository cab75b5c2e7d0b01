use super::{json_pretty, EXIT_SUCCESS};
use appcage_schema::parse_config_file;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn default_script_dir() -> Result<PathBuf, String> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/bin"))
        .ok_or_else(|| "HOME is not set; pass --script-dir".to_owned())
}

fn write_executable(dest: &Path, content: &str) -> Result<(), String> {
    let dir = dest
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| format!("write temp file: {e}"))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| format!("write temp file: {e}"))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o755))
        .map_err(|e| format!("chmod temp file: {e}"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| format!("fsync temp file: {e}"))?;
    tmp.persist(dest)
        .map_err(|e| format!("persist control program: {}", e.error))?;
    Ok(())
}

pub fn run(
    config_path: &Path,
    script_dir: Option<&Path>,
    force: bool,
    json_output: bool,
) -> Result<u8, String> {
    let config = parse_config_file(config_path).map_err(|e| format!("configuration error: {e}"))?;
    let dir = match script_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_script_dir()?,
    };
    let dest = dir.join(config.name().as_str());
    if dest.exists() && !force {
        return Err(format!(
            "refusing to overwrite existing {} (pass --force)",
            dest.display()
        ));
    }
    let rendered = config
        .render()
        .map_err(|e| format!("configuration error: {e}"))?;
    write_executable(&dest, &rendered)?;

    if json_output {
        let payload = serde_json::json!({
            "status": "written",
            "path": dest.display().to_string(),
            "name": config.name().as_str(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("wrote {} for '{}'", dest.display(), config.name());
    }
    Ok(EXIT_SUCCESS)
}
