use std::{
    collections::BTreeMap,
    fs::{OpenOptions, create_dir_all, rename},
    io::Write,
    path::{Path, PathBuf},
};

use schema::Resource;

use crate::StoreError;

pub(crate) fn load_snapshot<R: Resource>(path: &Path) -> Result<BTreeMap<String, R>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let objects: Vec<R> = serde_json::from_str(&raw)?;
    Ok(objects
        .into_iter()
        .map(|object| (object.name().to_string(), object))
        .collect())
}

pub(crate) fn write_snapshot<R: Resource>(
    path: &Path,
    objects: &BTreeMap<String, R>,
) -> Result<(), StoreError> {
    let records: Vec<&R> = objects.values().collect();
    let payload = serde_json::to_vec_pretty(&records)?;
    write_atomic(path, &payload)?;
    Ok(())
}

/// Writes `data` to a sibling `.tmp` file, fsyncs it and renames it over
/// `path`. Missing parent directories are created.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent)?;
    }

    let mut tmp_path = path.to_path_buf().into_os_string();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    rename(tmp_path, path)
}
