//! Reading and atomically rewriting the data document

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::error::StoreError;
use crate::model::AppData;

/// Read `path`; `Ok(None)` if it does not exist yet
pub(super) fn load(path: &Path) -> Result<Option<AppData>, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Write pretty JSON to a sibling temp file, then rename over `path`
pub(super) fn save(path: &Path, data: &AppData) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(data)?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
