#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use idreset_kernel_contracts::PlatformFamily;

pub const TARGET_APP_NAME: &str = "Cursor";
pub const STORAGE_FILE_NAME: &str = "storage.json";
pub const BACKUP_DIR_NAME: &str = "backups";

/// Host-specific locations and names, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub platform: PlatformFamily,
    pub username: String,
    pub storage_path: PathBuf,
    pub backup_dir: PathBuf,
    pub process_names: Vec<String>,
    pub updater_path: Option<PathBuf>,
    pub app_update_yml: Option<PathBuf>,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::for_platform(PlatformFamily::current())
    }

    pub fn for_platform(platform: PlatformFamily) -> Self {
        let username = current_username();
        let home = user_home(platform, &username);

        let storage_path = env_path("IDRESET_STORAGE_PATH")
            .unwrap_or_else(|| default_storage_path(platform, home.as_ref()));
        let backup_dir = env_path("IDRESET_BACKUP_DIR").unwrap_or_else(|| {
            storage_path
                .parent()
                .map(|dir| dir.join(BACKUP_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from(BACKUP_DIR_NAME))
        });
        let process_names = env::var("IDRESET_PROCESS_NAMES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| default_process_names(platform));
        let updater_path = env_path("IDRESET_UPDATER_PATH")
            .or_else(|| default_updater_path(platform, home.as_ref()));
        let app_update_yml =
            env_path("IDRESET_APP_UPDATE_YML").or_else(|| default_app_update_yml(platform));

        Self {
            platform,
            username,
            storage_path,
            backup_dir,
            process_names,
            updater_path,
            app_update_yml,
        }
    }
}

/// Prefers `SUDO_USER` so paths resolve to the invoking user's profile under sudo.
pub fn current_username() -> String {
    ["SUDO_USER", "USER", "USERNAME"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn user_home(platform: PlatformFamily, username: &str) -> Option<PathBuf> {
    let under_sudo = env::var("SUDO_USER").map(|v| !v.trim().is_empty()).unwrap_or(false);
    match platform {
        PlatformFamily::MacOs if under_sudo => Some(PathBuf::from("/Users").join(username)),
        PlatformFamily::Linux if under_sudo => Some(PathBuf::from("/home").join(username)),
        PlatformFamily::Windows => env_path("USERPROFILE"),
        _ => env_path("HOME"),
    }
}

fn default_storage_path(platform: PlatformFamily, home: Option<&PathBuf>) -> PathBuf {
    let global_storage = |base: PathBuf| {
        base.join(TARGET_APP_NAME)
            .join("User")
            .join("globalStorage")
            .join(STORAGE_FILE_NAME)
    };
    match platform {
        PlatformFamily::Windows => global_storage(env_path("APPDATA").unwrap_or_default()),
        PlatformFamily::MacOs => global_storage(
            home.cloned()
                .unwrap_or_default()
                .join("Library")
                .join("Application Support"),
        ),
        PlatformFamily::Linux => global_storage(home.cloned().unwrap_or_default().join(".config")),
        PlatformFamily::Other(_) => PathBuf::from(STORAGE_FILE_NAME),
    }
}

fn default_process_names(platform: PlatformFamily) -> Vec<String> {
    match platform {
        PlatformFamily::Windows => vec![format!("{TARGET_APP_NAME}.exe")],
        _ => vec![
            TARGET_APP_NAME.to_string(),
            TARGET_APP_NAME.to_ascii_lowercase(),
        ],
    }
}

fn default_updater_path(platform: PlatformFamily, home: Option<&PathBuf>) -> Option<PathBuf> {
    match platform {
        PlatformFamily::Windows => env_path("LOCALAPPDATA").map(|p| p.join("cursor-updater")),
        PlatformFamily::MacOs => home.map(|h| {
            h.join("Library")
                .join("Application Support")
                .join("Caches")
                .join("cursor-updater")
        }),
        PlatformFamily::Linux => home.map(|h| h.join(".config").join("cursor-updater")),
        PlatformFamily::Other(_) => None,
    }
}

fn default_app_update_yml(platform: PlatformFamily) -> Option<PathBuf> {
    match platform {
        PlatformFamily::MacOs => Some(PathBuf::from(
            "/Applications/Cursor.app/Contents/Resources/app-update.yml",
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_host_01_linux_storage_lives_under_global_storage() {
        let cfg = HostConfig::for_platform(PlatformFamily::Linux);
        if env::var("IDRESET_STORAGE_PATH").is_err() {
            assert!(cfg.storage_path.ends_with("Cursor/User/globalStorage/storage.json"));
        }
        assert!(!cfg.process_names.is_empty());
        assert!(cfg.app_update_yml.is_none() || env::var("IDRESET_APP_UPDATE_YML").is_ok());
    }

    #[test]
    fn at_host_02_windows_watches_exe_image_name() {
        if env::var("IDRESET_PROCESS_NAMES").is_ok() {
            return;
        }
        let cfg = HostConfig::for_platform(PlatformFamily::Windows);
        assert_eq!(cfg.process_names, vec!["Cursor.exe".to_string()]);
    }

    #[test]
    fn at_host_03_unknown_platform_has_no_updater_path() {
        if env::var("IDRESET_UPDATER_PATH").is_ok() {
            return;
        }
        let cfg = HostConfig::for_platform(PlatformFamily::Other("plan9"));
        assert!(cfg.updater_path.is_none());
        assert_eq!(cfg.storage_path, PathBuf::from(STORAGE_FILE_NAME));
    }
}
