use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListingStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentsMsg {
    pub status: ListingStatus,
    pub message: String,
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolesMsg {
    pub status: ListingStatus,
    pub message: String,
    pub roles: Vec<String>,
}

async fn dir_entries(dir: &Path) -> std::io::Result<Vec<(String, bool)>> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
    }
    Ok(entries)
}

/// Every non-hidden directory across the environment path.
pub async fn environments(environment_path: &[PathBuf]) -> EnvironmentsMsg {
    let mut environments = Vec::new();
    for dir in environment_path {
        match dir_entries(dir).await {
            Ok(entries) => environments.extend(
                entries
                    .into_iter()
                    .filter(|(name, is_dir)| *is_dir && !name.starts_with('.'))
                    .map(|(name, _)| name),
            ),
            Err(e) => {
                return EnvironmentsMsg {
                    status: ListingStatus::Error,
                    message: format!("Failed to read environment path {}: {e}", dir.display()),
                    environments,
                };
            }
        }
    }
    environments.sort();
    environments.dedup();
    EnvironmentsMsg {
        status: ListingStatus::Ok,
        message: String::new(),
        environments,
    }
}

/// Role manifests available in `environment`, first match on the path wins.
pub async fn roles(environment_path: &[PathBuf], environment: &str) -> RolesMsg {
    let error = |message: String| RolesMsg {
        status: ListingStatus::Error,
        message,
        roles: Vec::new(),
    };

    let mut role_dir = None;
    for dir in environment_path {
        match dir_entries(dir).await {
            Ok(entries) => {
                if entries.iter().any(|(name, is_dir)| *is_dir && name == environment) {
                    role_dir = Some(dir.join(environment).join("site/role/manifests"));
                    break;
                }
            }
            Err(e) => {
                return error(format!(
                    "Failed to read environment path {}: {e}",
                    dir.display()
                ));
            }
        }
    }
    let Some(role_dir) = role_dir else {
        return error(format!("Failed to find environment directory for '{environment}'"));
    };

    match dir_entries(&role_dir).await {
        Ok(entries) => {
            let mut roles: Vec<String> = entries
                .into_iter()
                .filter_map(|(name, _)| name.strip_suffix(".pp").map(str::to_owned))
                .collect();
            roles.sort();
            RolesMsg {
                status: ListingStatus::Ok,
                message: String::new(),
                roles,
            }
        }
        Err(e) => error(format!(
            "Failed to read role path {}: {e}",
            role_dir.display()
        )),
    }
}
