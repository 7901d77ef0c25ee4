//! Catalog command implementation.

use serde::Serialize;
use std::path::Path;
use streamsync_protocol::{LogicalStream, StreamRequirements, NAMESPACE_PLACEHOLDER};

/// One catalog entry as displayed.
#[derive(Debug, Serialize)]
pub struct CatalogEntry {
    /// Stream name.
    pub name: String,
    /// URL path.
    pub url_path: String,
    /// Opened once per namespace.
    pub namespaced: bool,
    /// Requires explicit parameters; never opened automatically.
    pub reserved: bool,
}

/// Loads a catalog file.
pub fn load(path: &Path) -> Result<Vec<LogicalStream>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let entries: Vec<LogicalStream> = serde_json::from_str(&text)?;
    validate(&entries)?;
    Ok(entries)
}

/// Checks names are unique and namespaced paths carry the placeholder.
pub fn validate(entries: &[LogicalStream]) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        if !seen.insert(entry.name.as_str()) {
            return Err(format!("duplicate stream '{}'", entry.name));
        }
        if entry.namespaced && !entry.url_path.contains(NAMESPACE_PLACEHOLDER) {
            return Err(format!(
                "namespaced stream '{}' has no {} in its path",
                entry.name, NAMESPACE_PLACEHOLDER
            ));
        }
    }
    Ok(())
}

/// Runs the catalog command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let requirements = StreamRequirements::default();
    let entries: Vec<CatalogEntry> = load(path)?
        .into_iter()
        .map(|stream| CatalogEntry {
            reserved: requirements.is_excluded(&stream.name),
            name: stream.name,
            url_path: stream.url_path,
            namespaced: stream.namespaced,
        })
        .collect();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("Catalog: {}", path.display());
        println!("  Streams: {}", entries.len());
        for entry in &entries {
            let mut flags = Vec::new();
            if entry.namespaced {
                flags.push("namespaced");
            }
            if entry.reserved {
                flags.push("reserved");
            }
            println!("  {:<24} {} {}", entry.name, entry.url_path, flags.join(","));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicates_and_missing_placeholder() {
        let dup = vec![
            LogicalStream::new("alarms", "/a"),
            LogicalStream::new("alarms", "/b"),
        ];
        assert!(validate(&dup).unwrap_err().contains("duplicate"));

        let bad = vec![LogicalStream::namespaced("nodes", "/core/v1/nodes")];
        assert!(validate(&bad).is_err());

        let good = vec![
            LogicalStream::namespaced("nodes", "/core/v1/namespaces/{namespace}/nodes"),
            LogicalStream::new("alarms", "/core/v1/alarms"),
        ];
        assert!(validate(&good).is_ok());
    }

    #[test]
    fn parses_catalog_json() {
        let entries: Vec<LogicalStream> = serde_json::from_str(
            r#"[{"name":"nodes","url_path":"/ns/{namespace}/nodes","namespaced":true},
                {"name":"alarms","url_path":"/alarms"}]"#,
        )
        .unwrap();
        assert!(entries[0].namespaced);
        assert!(!entries[1].namespaced);
    }
}
