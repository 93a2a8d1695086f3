//! Agent-directed remote commands
//!
//! Every operation a UI can ask of an agent travels in one `remoteCommand`
//! envelope as `{ "command": <name>, "parameters": {...} }`, so the server
//! forwards all of them through the same path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    content = "parameters",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RemoteCommand {
    // Status / configuration
    GetStatus,
    GetConfiguration,
    SetConfiguration {
        values: Metadata,
    },

    // Profiles
    ListProfiles,
    GetProfile {
        name: String,
    },
    CreateProfile {
        name: String,
        #[serde(default)]
        config: Value,
    },
    UpdateProfile {
        name: String,
        #[serde(default)]
        config: Value,
    },
    DeleteProfile {
        name: String,
    },
    SetActiveProfile {
        name: String,
    },

    // Task history
    GetTaskHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    GetTaskDetails {
        task_id: String,
    },

    // Task control
    ResumeTask {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    ClearTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    PressPrimaryButton {
        task_id: String,
    },
    PressSecondaryButton {
        task_id: String,
    },
    SendMessage {
        task_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
}

impl RemoteCommand {
    /// Wire name of the command, as echoed in `remoteCommandResponse.command`.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCommand::GetStatus => "getStatus",
            RemoteCommand::GetConfiguration => "getConfiguration",
            RemoteCommand::SetConfiguration { .. } => "setConfiguration",
            RemoteCommand::ListProfiles => "listProfiles",
            RemoteCommand::GetProfile { .. } => "getProfile",
            RemoteCommand::CreateProfile { .. } => "createProfile",
            RemoteCommand::UpdateProfile { .. } => "updateProfile",
            RemoteCommand::DeleteProfile { .. } => "deleteProfile",
            RemoteCommand::SetActiveProfile { .. } => "setActiveProfile",
            RemoteCommand::GetTaskHistory { .. } => "getTaskHistory",
            RemoteCommand::GetTaskDetails { .. } => "getTaskDetails",
            RemoteCommand::ResumeTask { .. } => "resumeTask",
            RemoteCommand::CancelTask { .. } => "cancelTask",
            RemoteCommand::ClearTask { .. } => "clearTask",
            RemoteCommand::PressPrimaryButton { .. } => "pressPrimaryButton",
            RemoteCommand::PressSecondaryButton { .. } => "pressSecondaryButton",
            RemoteCommand::SendMessage { .. } => "sendMessage",
        }
    }

    /// The task the command targets, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            RemoteCommand::GetTaskDetails { task_id }
            | RemoteCommand::ResumeTask { task_id }
            | RemoteCommand::CancelTask { task_id }
            | RemoteCommand::PressPrimaryButton { task_id }
            | RemoteCommand::PressSecondaryButton { task_id }
            | RemoteCommand::SendMessage { task_id, .. } => Some(task_id),
            RemoteCommand::ClearTask { task_id } => task_id.as_deref(),
            _ => None,
        }
    }
}
