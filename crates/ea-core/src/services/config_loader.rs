use std::collections::HashSet;
use std::path::Path;

use crate::error::{FleetError, Result};
use crate::models::ClusterProfile;

/// Read the cluster profiles this daemon serves from a YAML list of
/// `{id, properties}` entries.
pub fn load(path: &Path) -> Result<Vec<ClusterProfile>> {
    if !path.exists() {
        return Err(FleetError::ProfilesNotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    let profiles: Vec<ClusterProfile> = serde_yaml::from_str(&contents)
        .map_err(|e| FleetError::InvalidSettings(e.to_string()))?;

    let mut seen = HashSet::new();
    for profile in &profiles {
        if profile.id.trim().is_empty() {
            return Err(FleetError::InvalidSettings(
                "cluster profile id must not be blank".into(),
            ));
        }
        if !seen.insert(profile.id.as_str()) {
            return Err(FleetError::InvalidSettings(format!(
                "duplicate cluster profile id '{}'",
                profile.id
            )));
        }
    }
    tracing::debug!(path = %path.display(), count = profiles.len(), "profiles_loaded");
    Ok(profiles)
}
