#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use axum::http::StatusCode;
use chrono::{SecondsFormat, Utc};
use idreset_engines::host::{HostConfig, TARGET_APP_NAME};
use idreset_engines::privilege::ElevationOutcome;
use idreset_kernel_contracts::identity::ResetRequest;
use idreset_kernel_contracts::{ResetError, ResetErrorKind};
use idreset_os::auto_update::AutoUpdateBlocker;
use idreset_os::reset::{ResetCollaborators, ResetOrchestrator, ResetStep};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

pub const PRIVILEGE_REQUIRED_MESSAGE: &str = "Administrator privileges required";

/// JSON body shared by every route. Unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ResetErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<ResetStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_elevation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_identifier_rotated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_modified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_restart: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl ApiEnvelope {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn failure(err: &ResetError) -> Self {
        let needs_elevation = err.kind() == ResetErrorKind::PrivilegeRequired;
        Self {
            success: false,
            error: Some(if needs_elevation {
                PRIVILEGE_REQUIRED_MESSAGE.to_string()
            } else {
                err.to_string()
            }),
            error_kind: Some(err.kind()),
            needs_elevation: needs_elevation.then_some(true),
            elevation_message: err.remediation().map(str::to_string),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterReply {
    pub status: StatusCode,
    pub body: ApiEnvelope,
}

impl AdapterReply {
    fn ok(body: ApiEnvelope) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn from_error(err: &ResetError) -> Self {
        Self {
            status: status_for(err.kind()),
            body: ApiEnvelope::failure(err),
        }
    }
}

pub fn status_for(kind: ResetErrorKind) -> StatusCode {
    match kind {
        ResetErrorKind::PrivilegeRequired => StatusCode::FORBIDDEN,
        ResetErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ResetErrorKind::UnsupportedPlatform => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub os: String,
    pub username: String,
    pub is_admin: bool,
    pub config_path: PathBuf,
    pub process_running: bool,
    pub language: String,
}

pub struct AdapterRuntime {
    host: HostConfig,
    deps: ResetCollaborators,
    auto_update: AutoUpdateBlocker,
    language: String,
}

impl AdapterRuntime {
    pub fn new(
        host: HostConfig,
        deps: ResetCollaborators,
        auto_update: AutoUpdateBlocker,
        language: String,
    ) -> Self {
        Self {
            host,
            deps,
            auto_update,
            language,
        }
    }

    /// Host collaborators resolved from the environment. `relaunch_args` are passed to
    /// an elevated relaunch of this binary.
    pub fn default_from_env(relaunch_args: Vec<String>) -> Self {
        let host = HostConfig::from_env();
        let deps = ResetCollaborators::from_host(&host, relaunch_args);
        let auto_update = AutoUpdateBlocker::from_host(&host);
        Self::new(host, deps, auto_update, language_from_env())
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    pub fn system_info(&self) -> AdapterReply {
        let info = SystemInfo {
            os: self.host.platform.to_string(),
            username: self.host.username.clone(),
            is_admin: self.deps.privilege.check().unwrap_or(false),
            config_path: self.host.storage_path.clone(),
            process_running: self.deps.processes.is_running(),
            language: self.language.clone(),
        };
        self.data_reply(&info)
    }

    pub fn config(&self) -> AdapterReply {
        match self.deps.store.read() {
            Ok(Some(record)) => self.data_reply(&record),
            Ok(None) => AdapterReply::ok(ApiEnvelope {
                data: Some(Value::Null),
                message: Some("No configuration file found".to_string()),
                ..ApiEnvelope::ok()
            }),
            Err(err) => AdapterReply::from_error(&err),
        }
    }

    pub fn reset(&self, request: ResetRequest) -> AdapterReply {
        match ResetOrchestrator::new(&self.deps).reset(request) {
            Ok(outcome) => {
                let rotated = outcome.system_identifier_rotated;
                let mut reply = self.data_reply(&outcome.record);
                reply.body.message = Some(format!(
                    "Configuration reset successfully. \
                     Please restart {TARGET_APP_NAME} for changes to take effect."
                ));
                reply.body.system_identifier_rotated = Some(rotated);
                reply.body.registry_modified = Some(rotated);
                reply
            }
            Err(failure) => {
                error!(step = %failure.step, error = %failure.error, "reset request failed");
                let mut reply = AdapterReply::from_error(&failure.error);
                reply.body.failed_step = Some(failure.step);
                reply.body.system_identifier_rotated = Some(failure.system_identifier_rotated);
                reply
            }
        }
    }

    pub fn kill_application(&self) -> AdapterReply {
        match ResetOrchestrator::new(&self.deps).stop_application() {
            Ok(_) => AdapterReply::ok(ApiEnvelope {
                message: Some(format!(
                    "All {TARGET_APP_NAME} processes closed successfully"
                )),
                ..ApiEnvelope::ok()
            }),
            Err(err) => AdapterReply::from_error(&err),
        }
    }

    pub fn check_application(&self) -> AdapterReply {
        let running = self.deps.processes.is_running();
        AdapterReply::ok(ApiEnvelope {
            data: Some(serde_json::json!({ "running": running })),
            ..ApiEnvelope::ok()
        })
    }

    pub fn generate_ids(&self) -> AdapterReply {
        match ResetOrchestrator::new(&self.deps).preview() {
            Ok(ids) => self.data_reply(&ids),
            Err(err) => AdapterReply::from_error(&err),
        }
    }

    pub fn elevate(&self) -> AdapterReply {
        match self.deps.privilege.elevate() {
            Ok(ElevationOutcome::AlreadyElevated) => AdapterReply::ok(ApiEnvelope {
                message: Some("Already running with administrator privileges".to_string()),
                is_admin: Some(true),
                ..ApiEnvelope::ok()
            }),
            Ok(ElevationOutcome::RelaunchRequested) => AdapterReply::ok(ApiEnvelope {
                message: Some(
                    "Privilege elevation initiated. \
                     Please approve the UAC prompt and refresh the page."
                        .to_string(),
                ),
                needs_restart: Some(true),
                ..ApiEnvelope::ok()
            }),
            Err(err) => AdapterReply::from_error(&err),
        }
    }

    pub fn disable_auto_update(&self) -> AdapterReply {
        let _scope = self.deps.lock_mutations();
        match self.auto_update.disable(self.deps.privilege.as_ref()) {
            Ok(report) => {
                for operation in &report.operations {
                    info!(operation = %operation, "auto-update operation");
                }
                AdapterReply::ok(ApiEnvelope {
                    message: Some(format!(
                        "Auto-update disabled successfully. \
                         You'll need to manually update {TARGET_APP_NAME} in the future."
                    )),
                    operations: Some(report.operations),
                    paths: Some(report.paths),
                    platform: Some(report.platform),
                    ..ApiEnvelope::ok()
                })
            }
            Err(err) => AdapterReply::from_error(&err),
        }
    }

    pub fn health(&self) -> AdapterReply {
        AdapterReply::ok(ApiEnvelope {
            status: Some("healthy".to_string()),
            time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..ApiEnvelope::ok()
        })
    }

    pub fn invalid_request(&self, reason: impl Into<String>) -> AdapterReply {
        AdapterReply::from_error(&ResetError::InvalidRequest(reason.into()))
    }

    fn data_reply<T: Serialize>(&self, data: &T) -> AdapterReply {
        match serde_json::to_value(data) {
            Ok(value) => AdapterReply::ok(ApiEnvelope {
                data: Some(value),
                ..ApiEnvelope::ok()
            }),
            Err(err) => AdapterReply {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: ApiEnvelope {
                    success: false,
                    error: Some(format!("failed to encode response: {err}")),
                    ..ApiEnvelope::default()
                },
            },
        }
    }
}

pub fn language_from_env() -> String {
    let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|v| !v.trim().is_empty());
    language_from_locale(locale.as_deref()).to_string()
}

/// `cn` for Chinese locales, `en` otherwise.
pub fn language_from_locale(locale: Option<&str>) -> &'static str {
    match locale {
        Some(l) if l.trim().to_ascii_lowercase().starts_with("zh") => "cn",
        _ => "en",
    }
}
