use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

fn write(path: &Path, contents: &str) -> TestResult<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(path.to_path_buf())
}

/// Time series procedure `urn:sensor:buoy-1` measuring `fields` (all quantities).
pub fn write_timeseries_procedure(tmp: &TempDir, fields: &[&str]) -> TestResult<PathBuf> {
    let mut entries = vec![r#"{"name": "time", "data_type": "TIME", "index": 0}"#.to_string()];
    for (i, name) in fields.iter().enumerate() {
        entries.push(format!(
            r#"{{"name": "{name}", "data_type": "QUANTITY", "index": {}, "uom": "degC"}}"#,
            i + 1
        ));
    }
    let json = format!(
        r#"{{
  "procedure_id": "urn:sensor:buoy-1",
  "internal_id": 1,
  "type": "TIMESERIES",
  "main_field": {{"name": "time", "data_type": "TIME", "index": 0}},
  "fields": [{}]
}}"#,
        entries.join(", ")
    );
    write(&tmp.path().join("procedure.json"), &json)
}

/// Profile procedure `urn:sensor:ctd-2` ordered by `depth`, measuring `temp`.
pub fn write_profile_procedure(tmp: &TempDir) -> TestResult<PathBuf> {
    let json = r#"{
  "procedure_id": "urn:sensor:ctd-2",
  "internal_id": 2,
  "type": "PROFILE",
  "main_field": {"name": "depth", "data_type": "QUANTITY", "index": 0},
  "fields": [
    {"name": "depth", "data_type": "QUANTITY", "index": 0},
    {"name": "temp", "data_type": "QUANTITY", "index": 1}
  ]
}"#;
    write(&tmp.path().join("profile.json"), json)
}

/// Narrow CSV rows `time,obsprop_id,result` with one minute between instants.
pub fn write_timeseries_rows(
    tmp: &TempDir,
    name: &str,
    rows: &[(i64, &str, f64)],
) -> TestResult<PathBuf> {
    let mut csv = String::from("time,obsprop_id,result\n");
    for (minute, prop, value) in rows {
        csv.push_str(&format!(
            "2024-01-01T{:02}:{:02}:00Z,{prop},{value}\n",
            minute / 60,
            minute % 60
        ));
    }
    write(&tmp.path().join(name), &csv)
}

pub fn write_file(tmp: &TempDir, name: &str, contents: &str) -> TestResult<PathBuf> {
    write(&tmp.path().join(name), contents)
}

pub fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
