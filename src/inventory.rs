use crate::instance::Instance;
use eyre::{eyre, Result, WrapErr};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const IDENTITY_COLUMNS: [&str; 4] = ["cloud", "account", "region", "id"];

/// Load the target inventory from a CSV file.
///
/// The four identity columns are required; every other column lands in the
/// instance's metadata keyed by its header (empty cells are dropped). Rows
/// with an empty id and duplicate identities are rejected with row context so
/// a bad inventory fails before anything touches the fleet.
pub fn load_inventory(path: &Path) -> Result<Vec<Instance>> {
    let mut reader = csv::Reader::from_path(path)
        .wrap_err_with(|| format!("failed to open inventory {}", path.display()))?;

    let headers = reader
        .headers()
        .wrap_err_with(|| format!("failed to read inventory header from {}", path.display()))?
        .clone();
    for required in IDENTITY_COLUMNS {
        if !headers.iter().any(|h| h == required) {
            return Err(eyre!(
                "inventory {} is missing required column '{required}'",
                path.display()
            ));
        }
    }

    let mut instances = Vec::new();
    let mut seen = HashSet::new();
    for (index, record) in reader.records().enumerate() {
        // +2: one for the header, one for 1-based numbering.
        let row = index + 2;
        let record = record.wrap_err_with(|| format!("invalid CSV record at row {row}"))?;

        let mut identity: HashMap<&str, String> = HashMap::new();
        let mut metadata = HashMap::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            let value = value.trim();
            if let Some(&column) = IDENTITY_COLUMNS.iter().find(|c| **c == header) {
                identity.insert(column, value.to_string());
            } else if !value.is_empty() {
                metadata.insert(header.to_string(), value.to_string());
            }
        }

        let id = identity.remove("id").unwrap_or_default();
        if id.is_empty() {
            return Err(eyre!("inventory row {row} has an empty instance id"));
        }
        let mut instance = Instance::new(
            identity.remove("cloud").unwrap_or_default(),
            identity.remove("account").unwrap_or_default(),
            identity.remove("region").unwrap_or_default(),
            id,
        );
        instance.metadata = metadata;

        if !seen.insert(instance.identity()) {
            return Err(eyre!(
                "duplicate instance {} at inventory row {row}",
                instance.identity()
            ));
        }
        instances.push(instance);
    }

    if instances.is_empty() {
        return Err(eyre!("inventory {} contains no instances", path.display()));
    }
    Ok(instances)
}
